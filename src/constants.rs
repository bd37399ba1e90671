//! System-wide configuration defaults.
//! Most of these are overridable at runtime through [`crate::config::Config`];
//! the values here are the fallbacks baked into the binary.

// SCHEDULER

/// Scheduler tick interval. 10s balances dispatch latency against the cost
/// of a full eligibility scan over the pending-task set on every tick.
pub const SCHEDULER_TICK_INTERVAL_SECS: u64 = 10;

/// Retry backoff base for a failed subtask: first retry waits this long.
pub const RETRY_BACKOFF_BASE_SECS: u64 = 5;

/// Retry backoff growth factor (exponential).
pub const RETRY_BACKOFF_FACTOR: u64 = 2;

/// Retry backoff ceiling, regardless of attempt count.
pub const RETRY_BACKOFF_CAP_SECS: u64 = 300;

/// How long an agent may stay OFFLINE with a RUNNING subtask assigned before
/// the Scheduler gives up retrying it and fails the row with "no-agent".
pub const AGENT_GRACE_PERIOD_SECS: u64 = 600;

/// Grace window after a cancellation is sent before a still-RUNNING row is
/// force-transitioned to CANCELLED without an agent acknowledgement.
pub const CANCEL_GRACE_SECS: u64 = 30;

/// Extra grace the Scheduler gives a RUNNING row past its own
/// `timeout_seconds` before force-failing it. The agent's own watchdog is
/// authoritative; this is only the controller-side safety net for an agent
/// that silently wedges (spec §5: "dispatched_at + timeout + grace").
pub const DISPATCH_TIMEOUT_GRACE_SECS: u64 = 30;

// PRESENCE

/// Minimum presence timeout floor, regardless of configured heartbeat
/// interval (spec: "3x heartbeat period, minimum 90s").
pub const PRESENCE_TIMEOUT_FLOOR_SECS: u64 = 90;

/// Multiplier applied to the heartbeat interval to derive the presence
/// timeout.
pub const PRESENCE_TIMEOUT_MULTIPLIER: u64 = 3;

/// How often the presence reaper polls for OFFLINE/FREE transitions purely
/// to emit lifecycle events; it never mutates agent rows itself.
pub const PRESENCE_REAPER_INTERVAL_SECS: u64 = 30;

// AGENT RUNTIME

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default fingerprint refresh (update_config) period. Deliberately much
/// longer than heartbeat — fingerprints change far less often than liveness.
pub const DEFAULT_CONFIG_UPDATE_INTERVAL_SECS: u64 = 600;

/// Ceiling on the agent's registration retry backoff.
pub const REGISTER_BACKOFF_CAP_SECS: u64 = 60;

/// Ceiling on the persistent-channel reconnect backoff.
pub const RECONNECT_BACKOFF_CAP_SECS: u64 = 30;

// HTTP

/// Request timeout for controller<->agent HTTP calls, independent of any
/// subtask-level timeout.
pub const HTTP_REQUEST_TIMEOUT_SECS: u64 = 10;

/// General per-IP rate limit ceiling.
pub const GENERAL_REQUESTS_PER_MINUTE: u32 = 600;

/// Tighter per-IP rate limit applied to task creation.
pub const TASK_CREATE_REQUESTS_PER_MINUTE: u32 = 60;

// STORE

/// Current schema version. Bump on every migration and append a matching
/// entry to `store::MIGRATIONS`.
pub const SCHEMA_VERSION: i64 = 1;

/// Default page size for list endpoints that accept a `limit` query param.
pub const DEFAULT_LOG_LIMIT: usize = 200;

// MONITORING

/// How often the monitoring snapshot is recomputed and logged.
pub const MONITORING_SNAPSHOT_INTERVAL_SECS: u64 = 60;
