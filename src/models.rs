use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Liveness classification of an agent. Never stored — always derived from
/// `(last_heartbeat, current_task_id, now)` by the presence tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Offline,
    Free,
    Busy,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Offline => write!(f, "offline"),
            Presence::Free => write!(f, "free"),
            Presence::Busy => write!(f, "busy"),
        }
    }
}

/// Opaque structured description of an agent's hardware/OS, sampled by the
/// agent runtime and carried verbatim by the controller. The core never
/// interprets these fields; it only stores and returns them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Fingerprint {
    pub cpu: Option<serde_json::Value>,
    pub memory: Option<serde_json::Value>,
    pub gpu: Option<serde_json::Value>,
    pub os: Option<serde_json::Value>,
    pub disk: Option<serde_json::Value>,
    pub summary: Option<serde_json::Value>,
}

/// Durable record of a registered agent. Derived `presence` is computed by
/// [`crate::presence`] and is deliberately not a field here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub address: String,
    pub capabilities: HashSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_config_update: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub current_task_id: Option<i64>,
    pub current_subtask_id: Option<i64>,
}

impl Agent {
    /// `(current_task_id, current_subtask_id)` is either both-null or
    /// both-non-null by construction of every Store mutation; this exposes
    /// that combined value for callers that only care whether a slot is
    /// held.
    pub fn assignment(&self) -> Option<(i64, i64)> {
        match (self.current_task_id, self.current_subtask_id) {
            (Some(t), Some(s)) => Some((t, s)),
            _ => None,
        }
    }
}

/// Closed registry of subtask kinds the agent runtime knows how to execute.
/// Task creation validates every embedded subtask's `name` against this set;
/// unknown kinds are rejected before any row is written (Design Notes:
/// "Dynamic subtask kinds").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskKind {
    GetHostname,
    GetSystemInfo,
    Ping,
}

impl SubtaskKind {
    pub const ALL: [SubtaskKind; 3] = [
        SubtaskKind::GetHostname,
        SubtaskKind::GetSystemInfo,
        SubtaskKind::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskKind::GetHostname => "get_hostname",
            SubtaskKind::GetSystemInfo => "get_system_info",
            SubtaskKind::Ping => "ping",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SubtaskKind::GetHostname => "Report the agent machine's hostname",
            SubtaskKind::GetSystemInfo => "Report the agent's current fingerprint",
            SubtaskKind::Ping => "Liveness probe, replies with a fresh fingerprint",
        }
    }

    pub fn parse(name: &str) -> Option<SubtaskKind> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for SubtaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subtask definition embedded in a [`Task`]. Not a durable row on its own —
/// it lives inside the task's `subtasks` JSON column; each dispatch attempt
/// produces a separate [`SubtaskExecution`] row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub name: String,
    pub target_agent: String,
    pub order: i64,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub kwargs: serde_json::Value,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub stop_on_failure: bool,
}

/// Overall task status. Legal transitions are enforced by the Store (spec §7):
/// `Pending -> Running -> {Completed, Failed}`; any state -> `Cancelled`;
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition per the absorbing-terminal
    /// rule in spec §7.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == TaskStatus::Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Pending)
                | (TaskStatus::Running, TaskStatus::Running)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub schedule_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub max_retries: u32,
    pub send_email: bool,
    pub email_recipients: Vec<String>,
    pub subtasks: Vec<Subtask>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Firing time of this instance when created from a cron expression;
    /// `None` for a plain one-shot task. Used for overlap detection (spec
    /// §4.4.5) and does not affect `created_at`.
    pub cron_fired_at: Option<DateTime<Utc>>,
}

/// Request body for `POST /api/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub subtasks: Vec<Subtask>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub send_email: bool,
    #[serde(default)]
    pub email_recipients: Vec<String>,
    #[serde(default)]
    pub max_retries: u32,
}

/// Per-attempt durable record of running one subtask on one agent. Immutable
/// once it reaches a terminal status (spec P7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskExecution {
    pub id: i64,
    pub task_id: i64,
    pub subtask_name: String,
    pub order: i64,
    pub agent_name: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_seconds: Option<f64>,
    pub attempt_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Append-only operator-log entry. Not authoritative state — purely for the
/// log view (spec §3, CommLogEntry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
    pub agent_address: String,
    pub action: String,
    pub message: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

/// Per-agent rollup inside a [`TaskSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent: String,
    pub overall_success: bool,
    pub successful: u32,
    pub total: u32,
    pub subtasks: Vec<SubtaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSummary {
    pub name: String,
    pub order: i64,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub elapsed: Option<f64>,
    pub attempts: u32,
}

/// Structured aggregate handed to the reporter hook on task completion
/// (spec §4.6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: i64,
    pub name: String,
    pub verdict: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub elapsed: Option<f64>,
    pub per_agent: Vec<AgentSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_legal_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn subtask_kind_roundtrips_through_its_name() {
        for kind in SubtaskKind::ALL {
            assert_eq!(SubtaskKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SubtaskKind::parse("nonexistent_kind"), None);
    }

    #[test]
    fn agent_assignment_is_both_or_neither() {
        let mut agent = Agent {
            name: "a1".into(),
            address: "127.0.0.1:9000".into(),
            capabilities: HashSet::new(),
            last_heartbeat: Utc::now(),
            last_config_update: Utc::now(),
            fingerprint: Fingerprint::default(),
            current_task_id: None,
            current_subtask_id: None,
        };
        assert_eq!(agent.assignment(), None);
        agent.current_task_id = Some(1);
        agent.current_subtask_id = Some(2);
        assert_eq!(agent.assignment(), Some((1, 2)));
    }
}
