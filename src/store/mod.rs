//! The durable source of truth (spec §4.1).
//!
//! Backed by an embedded SQLite file — no external database process, per
//! the Non-goals. A single `Mutex<Connection>` is the serialization point:
//! every mutation runs inside one transaction, and change events are
//! published only after that transaction commits. Readers take the same
//! lock; there is no separate reader pool, which keeps the at-most-one
//! invariants trivially consistent at the cost of reader parallelism this
//! workload does not need.

use crate::error::{CoreError, Result};
use crate::event_bus::{Event, EventBus};
use crate::models::{
    Agent, CommLogEntry, CreateTaskRequest, ExecutionStatus, Fingerprint, LogLevel, Subtask,
    SubtaskExecution, SubtaskKind, Task, TaskStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

mod migrations;
mod rows;

pub use migrations::MIGRATIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Updated,
}

/// Everything required to create a [`SubtaskExecution`] row. The Scheduler
/// builds this; the Store assigns `id`, enforces the non-terminal
/// constraint, and returns the final row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub task_id: i64,
    pub subtask_name: String,
    pub order: i64,
    pub agent_name: String,
    pub attempt_index: u32,
}

pub struct Store {
    conn: Mutex<Connection>,
    events: Arc<EventBus>,
}

impl Store {
    pub fn open(database_path: &str, events: Arc<EventBus>) -> Result<Self> {
        let conn = Connection::open(database_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        let store = Store {
            conn: Mutex::new(conn),
            events,
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        let current_version: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| {
                r.get(0)
            })?;
        if current_version > crate::constants::SCHEMA_VERSION {
            return Err(CoreError::Fatal(format!(
                "on-disk schema version {current_version} is newer than this binary supports ({})",
                crate::constants::SCHEMA_VERSION
            )));
        }
        for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
            conn.execute_batch(migration.sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![migration.version, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    }

    fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    // ---------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------

    /// Validates subtask kinds against the registry and the cron expression
    /// (if any), then inserts the task row. Fails `InvalidInput` per spec
    /// §4.1.
    pub fn create_task(&self, spec: CreateTaskRequest) -> Result<i64> {
        for subtask in &spec.subtasks {
            if SubtaskKind::parse(&subtask.name).is_none() {
                return Err(CoreError::InvalidInput(format!(
                    "unknown subtask kind '{}'",
                    subtask.name
                )));
            }
        }
        if let Some(expr) = &spec.cron_expression {
            crate::scheduler::cron::validate(expr)?;
        }

        let now = Utc::now();
        let subtasks_json = serde_json::to_string(&spec.subtasks)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (
                name, schedule_time, cron_expression, max_retries, send_email,
                email_recipients, subtasks, status, created_at, started_at,
                completed_at, result, error, cron_fired_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, NULL, NULL, NULL)",
            params![
                spec.name,
                spec.schedule_time.map(|t| t.to_rfc3339()),
                spec.cron_expression,
                spec.max_retries,
                spec.send_email,
                serde_json::to_string(&spec.email_recipients)?,
                subtasks_json,
                TaskStatus::Pending.to_string(),
                now.to_rfc3339(),
            ],
        )?;
        let task_id = conn.last_insert_rowid();
        drop(conn);
        self.publish(Event::TaskCreated { task_id });
        Ok(task_id)
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(rows::SELECT_TASK, params![id], rows::task_from_row)
            .optional()
            .map_err(CoreError::from)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(rows::SELECT_TASKS_ALL)?;
        let tasks = stmt
            .query_map([], rows::task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Idempotent; rejects an illegal transition per [`TaskStatus::can_transition_to`].
    pub fn update_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        ts: DateTime<Utc>,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: String = conn
            .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        let current_status = rows::parse_task_status(&current)?;

        if current_status == status {
            // replay, no-op per R3/P4 idempotence
            return Ok(());
        }
        if !current_status.can_transition_to(status) {
            return Err(CoreError::InvalidInput(format!(
                "illegal task transition {current_status} -> {status}"
            )));
        }

        let started_at_clause = if status == TaskStatus::Running {
            ", started_at = COALESCE(started_at, ?5)"
        } else {
            ""
        };
        let completed_at_clause = if status.is_terminal() {
            ", completed_at = ?5"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE tasks SET status = ?1, result = ?2, error = ?3 {started_at_clause}{completed_at_clause} WHERE id = ?4"
        );
        // started_at/completed_at clauses both reference bind #5 (ts) but are
        // mutually exclusive per call since Running is never terminal.
        conn.execute(&sql, params![status.to_string(), result, error, id, ts.to_rfc3339()])?;
        drop(conn);

        match status {
            TaskStatus::Cancelled => self.publish(Event::TaskCancelled { task_id: id }),
            s if s.is_terminal() => self.publish(Event::TaskCompleted { task_id: id }),
            _ => self.publish(Event::TaskUpdated { task_id: id }),
        }
        Ok(())
    }

    pub fn delete_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(CoreError::NotFound(format!("task {id}")));
        }
        // cascades via ON DELETE CASCADE on subtask_executions.task_id
        Ok(())
    }

    // ---------------------------------------------------------------
    // Agents
    // ---------------------------------------------------------------

    pub fn register_agent(
        &self,
        name: &str,
        address: &str,
        capabilities: &HashSet<String>,
        fingerprint: &Fingerprint,
    ) -> Result<RegisterOutcome> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let existing_address: Option<String> = conn
            .query_row("SELECT address FROM agents WHERE name = ?1", params![name], |r| r.get(0))
            .optional()?;

        let outcome = match existing_address {
            Some(addr) if addr != address => {
                return Err(CoreError::InvalidInput(format!(
                    "agent '{name}' already registered with a different address"
                )));
            }
            Some(_) => RegisterOutcome::Updated,
            None => RegisterOutcome::Created,
        };

        conn.execute(
            "INSERT INTO agents (
                name, address, capabilities, last_heartbeat, last_config_update,
                fingerprint, current_task_id, current_subtask_id
            ) VALUES (?1, ?2, ?3, ?4, ?4, ?5, NULL, NULL)
            ON CONFLICT(name) DO UPDATE SET
                capabilities = excluded.capabilities,
                last_heartbeat = excluded.last_heartbeat,
                last_config_update = excluded.last_config_update,
                fingerprint = excluded.fingerprint",
            params![
                name,
                address,
                serde_json::to_string(capabilities)?,
                now.to_rfc3339(),
                serde_json::to_string(fingerprint)?,
            ],
        )?;
        drop(conn);
        self.publish(Event::AgentRegistered { name: name.to_string() });
        Ok(outcome)
    }

    pub fn update_agent_config(&self, name: &str, fingerprint: &Fingerprint) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE agents SET fingerprint = ?1, last_config_update = ?2 WHERE name = ?3",
            params![serde_json::to_string(fingerprint)?, Utc::now().to_rfc3339(), name],
        )?;
        if affected == 0 {
            return Err(CoreError::NotFound(format!("agent {name}")));
        }
        drop(conn);
        self.publish(Event::AgentConfigUpdated { name: name.to_string() });
        Ok(())
    }

    /// O(1) write of `last_heartbeat = now`. `status_hint` is advisory only
    /// (spec §4.2) and is not persisted as a status column; it is logged for
    /// operator visibility and otherwise ignored.
    pub fn touch_heartbeat(&self, name: &str, status_hint: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE agents SET last_heartbeat = ?1 WHERE name = ?2",
            params![Utc::now().to_rfc3339(), name],
        )?;
        if affected == 0 {
            return Err(CoreError::NotFound(format!("agent {name}")));
        }
        drop(conn);
        if let Some(hint) = status_hint {
            tracing::debug!(agent = name, hint, "heartbeat received (advisory status hint)");
        }
        self.publish(Event::Heartbeat { name: name.to_string() });
        Ok(())
    }

    pub fn get_agent(&self, name: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(rows::SELECT_AGENT, params![name], rows::agent_from_row)
            .optional()
            .map_err(CoreError::from)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(rows::SELECT_AGENTS_ALL)?;
        let agents = stmt
            .query_map([], rows::agent_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn delete_agent(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM agents WHERE name = ?1", params![name])?;
        if affected == 0 {
            return Err(CoreError::NotFound(format!("agent {name}")));
        }
        Ok(())
    }

    /// Both-or-neither (spec §4.1). Fails `InvalidInput` otherwise.
    pub fn set_agent_assignment(
        &self,
        name: &str,
        task_id: Option<i64>,
        subtask_id: Option<i64>,
    ) -> Result<()> {
        if task_id.is_some() != subtask_id.is_some() {
            return Err(CoreError::InvalidInput(
                "agent assignment must set both task_id and subtask_id, or neither".into(),
            ));
        }
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE agents SET current_task_id = ?1, current_subtask_id = ?2 WHERE name = ?3",
            params![task_id, subtask_id, name],
        )?;
        if affected == 0 {
            return Err(CoreError::NotFound(format!("agent {name}")));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Subtask executions
    // ---------------------------------------------------------------

    /// Enforces at-most-one-non-terminal-per-(task, subtask, agent) via a
    /// partial unique index; a violation surfaces as `Conflict`.
    pub fn create_execution(&self, row: NewExecution) -> Result<SubtaskExecution> {
        let conn = self.conn.lock().unwrap();
        let insert = conn.execute(
            "INSERT INTO subtask_executions (
                task_id, subtask_name, \"order\", agent_name, status,
                started_at, completed_at, result, error, execution_seconds, attempt_index
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, NULL, NULL, ?6)",
            params![
                row.task_id,
                row.subtask_name,
                row.order,
                row.agent_name,
                ExecutionStatus::Pending.to_string(),
                row.attempt_index,
            ],
        );
        let execution_id = match insert {
            Ok(_) => conn.last_insert_rowid(),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(CoreError::Conflict(format!(
                    "a non-terminal execution already exists for ({}, {}, {})",
                    row.task_id, row.subtask_name, row.agent_name
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let created = conn
            .query_row(rows::SELECT_EXECUTION, params![execution_id], rows::execution_from_row)?;
        Ok(created)
    }

    pub fn get_execution(&self, id: i64) -> Result<Option<SubtaskExecution>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(rows::SELECT_EXECUTION, params![id], rows::execution_from_row)
            .optional()
            .map_err(CoreError::from)
    }

    /// Looks up the single RUNNING row for `(task_id, subtask_name, agent_name)`,
    /// if any — used by the Result Collector to locate the row a
    /// `subtask_result` callback refers to (spec §4.6).
    pub fn get_running_execution(
        &self,
        task_id: i64,
        subtask_name: &str,
        agent_name: &str,
    ) -> Result<Option<SubtaskExecution>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            rows::SELECT_RUNNING_EXECUTION,
            params![task_id, subtask_name, agent_name],
            rows::execution_from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn update_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        result: Option<serde_json::Value>,
        error: Option<String>,
        execution_seconds: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: String = conn
            .query_row("SELECT status FROM subtask_executions WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()?
            .ok_or_else(|| CoreError::NotFound(format!("execution {id}")))?;
        let current_status = rows::parse_execution_status(&current)?;
        if current_status.is_terminal() {
            // Terminal rows never mutate (P7); replays of the same outcome
            // are a harmless no-op, anything else is an error.
            if current_status == status {
                return Ok(());
            }
            return Err(CoreError::Conflict(format!(
                "execution {id} is already terminal ({current_status})"
            )));
        }
        conn.execute(
            "UPDATE subtask_executions SET
                status = ?1, started_at = COALESCE(?2, started_at), completed_at = ?3,
                result = ?4, error = ?5, execution_seconds = ?6
             WHERE id = ?7",
            params![
                status.to_string(),
                started_at.map(|t| t.to_rfc3339()),
                completed_at.map(|t| t.to_rfc3339()),
                result.map(|v| v.to_string()),
                error,
                execution_seconds,
                id,
            ],
        )?;
        drop(conn);
        if status.is_terminal() {
            self.publish(Event::SubtaskCompleted { execution_id: id });
        } else {
            self.publish(Event::SubtaskUpdated { execution_id: id });
        }
        Ok(())
    }

    pub fn get_executions_for(
        &self,
        task_id: i64,
        subtask_name: Option<&str>,
        agent_name: Option<&str>,
    ) -> Result<Vec<SubtaskExecution>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("{} WHERE task_id = ?1", rows::SELECT_EXECUTIONS_BASE);
        if subtask_name.is_some() {
            sql.push_str(" AND subtask_name = ?2");
        }
        if agent_name.is_some() {
            sql.push_str(if subtask_name.is_some() {
                " AND agent_name = ?3"
            } else {
                " AND agent_name = ?2"
            });
        }
        sql.push_str(" ORDER BY \"order\" ASC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows_iter = match (subtask_name, agent_name) {
            (Some(s), Some(a)) => stmt.query_map(params![task_id, s, a], rows::execution_from_row),
            (Some(s), None) => stmt.query_map(params![task_id, s], rows::execution_from_row),
            (None, Some(a)) => stmt.query_map(params![task_id, a], rows::execution_from_row),
            (None, None) => stmt.query_map(params![task_id], rows::execution_from_row),
        }?;
        Ok(rows_iter.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Deletes every PENDING row for `(task_id, subtask_name, agent_name)`;
    /// used by cancellation (spec §4.4.3). Returns the number of rows removed.
    pub fn delete_pending_executions(
        &self,
        task_id: i64,
        subtask_name: &str,
        agent_name: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM subtask_executions
             WHERE task_id = ?1 AND subtask_name = ?2 AND agent_name = ?3 AND status = ?4",
            params![task_id, subtask_name, agent_name, ExecutionStatus::Pending.to_string()],
        )?;
        Ok(affected)
    }

    /// Atomically acquire an agent's assignment slot and create its PENDING
    /// execution row, in a single transaction under the one Store lock
    /// (spec §4.4 step 3: "Atomically: create a PENDING row; set agent
    /// assignment; call Dispatcher"). Fails `Conflict` if the agent is not
    /// actually free — the caller raced a concurrent assignment and should
    /// retry on the next tick rather than treat this as fatal.
    pub fn assign_and_create_execution(&self, new_row: NewExecution) -> Result<SubtaskExecution> {
        let conn = self.conn.lock().unwrap();

        let current_task: Option<i64> = conn
            .query_row(
                "SELECT current_task_id FROM agents WHERE name = ?1",
                params![new_row.agent_name],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", new_row.agent_name)))?;
        if current_task.is_some() {
            return Err(CoreError::Conflict(format!(
                "agent {} is no longer free",
                new_row.agent_name
            )));
        }

        let insert = conn.execute(
            "INSERT INTO subtask_executions (
                task_id, subtask_name, \"order\", agent_name, status,
                started_at, completed_at, result, error, execution_seconds, attempt_index
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, NULL, NULL, ?6)",
            params![
                new_row.task_id,
                new_row.subtask_name,
                new_row.order,
                new_row.agent_name,
                ExecutionStatus::Pending.to_string(),
                new_row.attempt_index,
            ],
        );
        let execution_id = match insert {
            Ok(_) => conn.last_insert_rowid(),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(CoreError::Conflict(format!(
                    "a non-terminal execution already exists for ({}, {}, {})",
                    new_row.task_id, new_row.subtask_name, new_row.agent_name
                )));
            }
            Err(e) => return Err(e.into()),
        };

        conn.execute(
            "UPDATE agents SET current_task_id = ?1, current_subtask_id = ?2 WHERE name = ?3",
            params![new_row.task_id, execution_id, new_row.agent_name],
        )?;

        let created = conn
            .query_row(rows::SELECT_EXECUTION, params![execution_id], rows::execution_from_row)?;
        drop(conn);
        self.publish(Event::SubtaskDispatched {
            task_id: new_row.task_id,
            execution_id,
        });
        Ok(created)
    }

    /// Undoes a slot acquired by [`Self::assign_and_create_execution`] when
    /// the Dispatcher subsequently fails to hand the work to the transport
    /// (spec §4.4 step 3: "On dispatcher failure, rollback the row and
    /// assignment").
    pub fn rollback_assignment(&self, execution_id: i64, agent_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM subtask_executions WHERE id = ?1", params![execution_id])?;
        conn.execute(
            "UPDATE agents SET current_task_id = NULL, current_subtask_id = NULL WHERE name = ?1",
            params![agent_name],
        )?;
        Ok(())
    }

    /// Clears an agent's assignment slot on any terminal transition (spec
    /// §4.6 step 3).
    pub fn clear_assignment(&self, agent_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE agents SET current_task_id = NULL, current_subtask_id = NULL WHERE name = ?1",
            params![agent_name],
        )?;
        Ok(())
    }

    /// Inserts a row that is already in a terminal state — used for
    /// stop-on-failure skips (CANCELLED, "skipped after upstream failure")
    /// and for the no-agent retry cutoff (FAILED, spec §4.4.2). Never
    /// collides with the non-terminal partial unique index.
    pub fn create_terminal_execution(
        &self,
        new_row: NewExecution,
        status: ExecutionStatus,
        error: &str,
    ) -> Result<SubtaskExecution> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO subtask_executions (
                task_id, subtask_name, \"order\", agent_name, status,
                started_at, completed_at, result, error, execution_seconds, attempt_index
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, NULL, ?7, NULL, ?8)",
            params![
                new_row.task_id,
                new_row.subtask_name,
                new_row.order,
                new_row.agent_name,
                status.to_string(),
                now,
                error,
                new_row.attempt_index,
            ],
        )?;
        let execution_id = conn.last_insert_rowid();
        let created = conn
            .query_row(rows::SELECT_EXECUTION, params![execution_id], rows::execution_from_row)?;
        drop(conn);
        self.publish(Event::SubtaskCompleted { execution_id });
        Ok(created)
    }

    /// Stamps a cron task's very first firing time. Unlike
    /// [`Self::rearm_cron_task`] this does not require the task to be
    /// terminal — it only runs once, before the task has ever dispatched.
    pub fn mark_cron_fired(&self, id: i64, fire_time: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE tasks SET cron_fired_at = ?1 WHERE id = ?2 AND cron_fired_at IS NULL",
            params![fire_time.to_rfc3339(), id],
        )?;
        if affected == 0 {
            return Err(CoreError::Conflict(format!("task {id} already has a firing time")));
        }
        Ok(())
    }

    /// Rearms a finished cron task in place for its next firing (spec
    /// §4.4.5). The prior cycle's execution rows are left untouched for
    /// audit; only the task row resets.
    pub fn rearm_cron_task(&self, id: i64, fire_time: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: String = conn
            .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        if !rows::parse_task_status(&current)?.is_terminal() {
            return Err(CoreError::Conflict(format!("task {id} is not terminal, cannot rearm")));
        }
        conn.execute(
            "UPDATE tasks SET status = ?1, started_at = NULL, completed_at = NULL,
             result = NULL, error = NULL, cron_fired_at = ?2 WHERE id = ?3",
            params![TaskStatus::Pending.to_string(), fire_time.to_rfc3339(), id],
        )?;
        drop(conn);
        self.publish(Event::TaskUpdated { task_id: id });
        Ok(())
    }

    /// Cancellation fan-out (spec §4.4.3): PENDING rows are deleted in place
    /// and their agent slot freed; RUNNING rows are left for the caller to
    /// notify and watch for a grace-period deadline, and are returned here.
    pub fn cancel_task_executions(&self, task_id: i64) -> Result<Vec<SubtaskExecution>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "{} WHERE task_id = ?1 AND status IN ('pending', 'running')",
            rows::SELECT_EXECUTIONS_BASE
        );
        let mut stmt = conn.prepare(&sql)?;
        let nonterminal: Vec<SubtaskExecution> = stmt
            .query_map(params![task_id], rows::execution_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for row in &nonterminal {
            if row.status == ExecutionStatus::Pending {
                conn.execute("DELETE FROM subtask_executions WHERE id = ?1", params![row.id])?;
                conn.execute(
                    "UPDATE agents SET current_task_id = NULL, current_subtask_id = NULL WHERE name = ?1",
                    params![row.agent_name],
                )?;
            }
        }
        Ok(nonterminal
            .into_iter()
            .filter(|r| r.status == ExecutionStatus::Running)
            .collect())
    }

    // ---------------------------------------------------------------
    // Comm log
    // ---------------------------------------------------------------

    pub fn append_log(
        &self,
        agent_name: &str,
        agent_address: &str,
        action: &str,
        message: &str,
        level: LogLevel,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO comm_log (timestamp, agent_name, agent_address, action, message, level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                agent_name,
                agent_address,
                action,
                message,
                level.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_logs(&self, agent_address: Option<&str>, limit: usize) -> Result<Vec<CommLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let limit = limit.min(10_000) as i64;
        if let Some(addr) = agent_address {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, agent_name, agent_address, action, message, level
                 FROM comm_log WHERE agent_address = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![addr, limit], rows::log_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, agent_name, agent_address, action, message, level
                 FROM comm_log ORDER BY id DESC LIMIT ?1",
            )?;
            let entries = stmt
                .query_map(params![limit], rows::log_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Subtask;

    fn test_store() -> Store {
        Store::open(":memory:", Arc::new(EventBus::new())).unwrap()
    }

    fn sample_task_spec() -> CreateTaskRequest {
        CreateTaskRequest {
            name: "t1".into(),
            subtasks: vec![Subtask {
                name: "get_hostname".into(),
                target_agent: "a1".into(),
                order: 0,
                args: serde_json::Value::Null,
                kwargs: serde_json::Value::Null,
                timeout_seconds: 30,
                max_retries: 0,
                stop_on_failure: false,
            }],
            schedule_time: None,
            cron_expression: None,
            send_email: false,
            email_recipients: vec![],
            max_retries: 0,
        }
    }

    #[test]
    fn create_and_fetch_task_roundtrips() {
        let store = test_store();
        let id = store.create_task(sample_task_spec()).unwrap();
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.name, "t1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.subtasks.len(), 1);
    }

    #[test]
    fn create_task_rejects_unknown_subtask_kind() {
        let store = test_store();
        let mut spec = sample_task_spec();
        spec.subtasks[0].name = "not_a_real_kind".into();
        assert!(matches!(store.create_task(spec), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn create_task_rejects_bad_cron() {
        let store = test_store();
        let mut spec = sample_task_spec();
        spec.cron_expression = Some("not a cron expr".into());
        assert!(matches!(store.create_task(spec), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn register_agent_rejects_address_conflict() {
        let store = test_store();
        let caps = HashSet::new();
        let fp = Fingerprint::default();
        store.register_agent("a1", "10.0.0.1:9000", &caps, &fp).unwrap();
        let result = store.register_agent("a1", "10.0.0.2:9000", &caps, &fp);
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn register_agent_same_address_is_update() {
        let store = test_store();
        let caps = HashSet::new();
        let fp = Fingerprint::default();
        let first = store.register_agent("a1", "10.0.0.1:9000", &caps, &fp).unwrap();
        let second = store.register_agent("a1", "10.0.0.1:9000", &caps, &fp).unwrap();
        assert_eq!(first, RegisterOutcome::Created);
        assert_eq!(second, RegisterOutcome::Updated);
        assert_eq!(store.list_agents().unwrap().len(), 1);
    }

    #[test]
    fn task_status_transition_is_idempotent_on_replay() {
        let store = test_store();
        let id = store.create_task(sample_task_spec()).unwrap();
        store
            .update_task_status(id, TaskStatus::Running, Utc::now(), None, None)
            .unwrap();
        store
            .update_task_status(id, TaskStatus::Completed, Utc::now(), Some("ok".into()), None)
            .unwrap();
        // replaying the same terminal status must not error (R-style idempotence)
        store
            .update_task_status(id, TaskStatus::Completed, Utc::now(), Some("ok".into()), None)
            .unwrap();
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn task_status_rejects_illegal_transition() {
        let store = test_store();
        let id = store.create_task(sample_task_spec()).unwrap();
        let result = store.update_task_status(id, TaskStatus::Completed, Utc::now(), None, None);
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn at_most_one_non_terminal_execution_is_enforced() {
        let store = test_store();
        let task_id = store.create_task(sample_task_spec()).unwrap();
        store
            .create_execution(NewExecution {
                task_id,
                subtask_name: "get_hostname".into(),
                order: 0,
                agent_name: "a1".into(),
                attempt_index: 0,
            })
            .unwrap();
        let conflict = store.create_execution(NewExecution {
            task_id,
            subtask_name: "get_hostname".into(),
            order: 0,
            agent_name: "a1".into(),
            attempt_index: 1,
        });
        assert!(matches!(conflict, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn terminal_execution_rows_do_not_mutate() {
        let store = test_store();
        let task_id = store.create_task(sample_task_spec()).unwrap();
        let row = store
            .create_execution(NewExecution {
                task_id,
                subtask_name: "get_hostname".into(),
                order: 0,
                agent_name: "a1".into(),
                attempt_index: 0,
            })
            .unwrap();
        store
            .update_execution(
                row.id,
                ExecutionStatus::Completed,
                Some(Utc::now()),
                Some(Utc::now()),
                Some(serde_json::json!({"hostname": "hostA1"})),
                None,
                Some(0.5),
            )
            .unwrap();
        let result = store.update_execution(
            row.id,
            ExecutionStatus::Failed,
            None,
            Some(Utc::now()),
            None,
            Some("late failure".into()),
            None,
        );
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn set_agent_assignment_rejects_partial_clear() {
        let store = test_store();
        let caps = HashSet::new();
        let fp = Fingerprint::default();
        store.register_agent("a1", "10.0.0.1:9000", &caps, &fp).unwrap();
        let result = store.set_agent_assignment("a1", Some(1), None);
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn delete_pending_executions_leaves_running_rows() {
        let store = test_store();
        let task_id = store.create_task(sample_task_spec()).unwrap();
        let pending = store
            .create_execution(NewExecution {
                task_id,
                subtask_name: "get_hostname".into(),
                order: 0,
                agent_name: "a1".into(),
                attempt_index: 0,
            })
            .unwrap();
        let deleted = store
            .delete_pending_executions(task_id, "get_hostname", "a1")
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_execution(pending.id).unwrap().is_none());
    }
}
