//! Row <-> model mapping. Kept separate from the query methods so the SQL
//! shape and the deserialization logic can be read side by side.

use crate::error::{CoreError, Result};
use crate::models::{
    Agent, CommLogEntry, ExecutionStatus, Fingerprint, LogLevel, Subtask, SubtaskExecution, Task,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{Error as SqliteError, Row};
use std::collections::HashSet;
use std::str::FromStr;

pub const SELECT_TASKS_ALL: &str = "SELECT id, name, schedule_time, cron_expression, max_retries,
    send_email, email_recipients, subtasks, status, created_at, started_at, completed_at,
    result, error, cron_fired_at FROM tasks ORDER BY id ASC";

pub const SELECT_TASK: &str = "SELECT id, name, schedule_time, cron_expression, max_retries,
    send_email, email_recipients, subtasks, status, created_at, started_at, completed_at,
    result, error, cron_fired_at FROM tasks WHERE id = ?1";

pub const SELECT_AGENTS_ALL: &str = "SELECT name, address, capabilities, last_heartbeat,
    last_config_update, fingerprint, current_task_id, current_subtask_id FROM agents ORDER BY name ASC";

pub const SELECT_AGENT: &str = "SELECT name, address, capabilities, last_heartbeat,
    last_config_update, fingerprint, current_task_id, current_subtask_id FROM agents WHERE name = ?1";

pub const SELECT_EXECUTIONS_BASE: &str = "SELECT id, task_id, subtask_name, \"order\", agent_name,
    status, started_at, completed_at, result, error, execution_seconds, attempt_index
    FROM subtask_executions";

pub const SELECT_EXECUTION: &str = "SELECT id, task_id, subtask_name, \"order\", agent_name,
    status, started_at, completed_at, result, error, execution_seconds, attempt_index
    FROM subtask_executions WHERE id = ?1";

pub const SELECT_RUNNING_EXECUTION: &str = "SELECT id, task_id, subtask_name, \"order\", agent_name,
    status, started_at, completed_at, result, error, execution_seconds, attempt_index
    FROM subtask_executions WHERE task_id = ?1 AND subtask_name = ?2 AND agent_name = ?3
    AND status = 'running'";

fn parse_rfc3339(s: &str, col: &'static str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SqliteError::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
        .map_err(|e| {
            tracing::error!(column = col, "failed to parse stored timestamp: {e}");
            e
        })
}

fn parse_rfc3339_opt(s: Option<String>, col: &'static str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_rfc3339(&s, col)).transpose()
}

pub fn parse_task_status(s: &str) -> Result<TaskStatus> {
    Ok(match s {
        "pending" => TaskStatus::Pending,
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        other => return Err(CoreError::Fatal(format!("unrecognized stored task status '{other}'"))),
    })
}

pub fn parse_execution_status(s: &str) -> Result<ExecutionStatus> {
    Ok(match s {
        "pending" => ExecutionStatus::Pending,
        "running" => ExecutionStatus::Running,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        "cancelled" => ExecutionStatus::Cancelled,
        other => {
            return Err(CoreError::Fatal(format!(
                "unrecognized stored execution status '{other}'"
            )))
        }
    })
}

pub fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(8)?;
    let status = parse_task_status(&status_raw)
        .map_err(|_| SqliteError::InvalidColumnType(8, "status".into(), rusqlite::types::Type::Text))?;
    let subtasks_raw: String = row.get(7)?;
    let subtasks: Vec<Subtask> = serde_json::from_str(&subtasks_raw)
        .map_err(|e| SqliteError::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e)))?;
    let email_recipients_raw: String = row.get(6)?;
    let email_recipients: Vec<String> = serde_json::from_str(&email_recipients_raw)
        .map_err(|e| SqliteError::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        schedule_time: parse_rfc3339_opt(row.get(2)?, "schedule_time")?,
        cron_expression: row.get(3)?,
        max_retries: row.get(4)?,
        send_email: row.get(5)?,
        email_recipients,
        subtasks,
        status,
        created_at: parse_rfc3339(&row.get::<_, String>(9)?, "created_at")?,
        started_at: parse_rfc3339_opt(row.get(10)?, "started_at")?,
        completed_at: parse_rfc3339_opt(row.get(11)?, "completed_at")?,
        result: row.get(12)?,
        error: row.get(13)?,
        cron_fired_at: parse_rfc3339_opt(row.get(14)?, "cron_fired_at")?,
    })
}

pub fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    let capabilities_raw: String = row.get(2)?;
    let capabilities: HashSet<String> = serde_json::from_str(&capabilities_raw)
        .map_err(|e| SqliteError::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))?;
    let fingerprint_raw: String = row.get(5)?;
    let fingerprint: Fingerprint = serde_json::from_str(&fingerprint_raw)
        .map_err(|e| SqliteError::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Agent {
        name: row.get(0)?,
        address: row.get(1)?,
        capabilities,
        last_heartbeat: parse_rfc3339(&row.get::<_, String>(3)?, "last_heartbeat")?,
        last_config_update: parse_rfc3339(&row.get::<_, String>(4)?, "last_config_update")?,
        fingerprint,
        current_task_id: row.get(6)?,
        current_subtask_id: row.get(7)?,
    })
}

pub fn execution_from_row(row: &Row) -> rusqlite::Result<SubtaskExecution> {
    let status_raw: String = row.get(5)?;
    let status = parse_execution_status(&status_raw)
        .map_err(|_| SqliteError::InvalidColumnType(5, "status".into(), rusqlite::types::Type::Text))?;
    let result_raw: Option<String> = row.get(8)?;
    let result = result_raw
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| SqliteError::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(SubtaskExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        subtask_name: row.get(2)?,
        order: row.get(3)?,
        agent_name: row.get(4)?,
        status,
        started_at: parse_rfc3339_opt(row.get(6)?, "started_at")?,
        completed_at: parse_rfc3339_opt(row.get(7)?, "completed_at")?,
        result,
        error: row.get(9)?,
        execution_seconds: row.get(10)?,
        attempt_index: row.get(11)?,
    })
}

pub fn log_from_row(row: &Row) -> rusqlite::Result<CommLogEntry> {
    let level_raw: String = row.get(6)?;
    let level = LogLevel::from_str(&level_raw).unwrap_or(LogLevel::Info);
    Ok(CommLogEntry {
        id: row.get(0)?,
        timestamp: parse_rfc3339(&row.get::<_, String>(1)?, "timestamp")?,
        agent_name: row.get(2)?,
        agent_address: row.get(3)?,
        action: row.get(4)?,
        message: row.get(5)?,
        level,
    })
}
