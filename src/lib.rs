//! # dispatchd
//!
//! A central controller that dispatches ordered subtasks to long-lived agent
//! processes running on other machines, collects their results, and rolls
//! them up into a task verdict.
//!
//! ## Architecture
//!
//! - **Store**: durable task/agent/execution state, backed by SQLite.
//! - **Scheduler**: the tick loop that assigns pending subtasks to free
//!   agents, retries failed ones with backoff, and arms/rearms cron tasks.
//! - **Collector**: ingests subtask results reported by agents and rolls a
//!   task's subtask executions up into a final verdict.
//! - **EventBus**: the per-agent "room" abstraction bridging dispatch
//!   messages to each agent's persistent WebSocket channel.
//! - **Api**: the HTTP surface agents and clients speak to the controller
//!   over.
//! - **Agent**: the runtime that runs on each machine, executing dispatched
//!   subtasks and reporting results back.

/// Agent-side runtime: registration, heartbeats, the persistent channel, and
/// the built-in subtask implementations.
pub mod agent;
/// HTTP API server and endpoints.
pub mod api;
/// System configuration for the controller and the agent runtime.
pub mod config;
/// System-wide constants.
pub mod constants;
/// Collects reported subtask results and rolls tasks up to a verdict.
pub mod collector;
/// Agent dispatch: choosing the next subtask to hand to a free agent.
pub mod dispatcher;
/// Error types and handling.
pub mod error;
/// Per-agent event rooms bridging the scheduler to agent WebSocket channels.
pub mod event_bus;
/// Core data models.
pub mod models;
/// Periodic operability snapshot (queue depth, agent presence, completion rate).
pub mod monitoring;
/// Agent presence derivation (free/busy/offline) from heartbeat recency.
pub mod presence;
/// Per-IP request throttling.
pub mod rate_limit;
/// Reports task outcomes to configured sinks.
pub mod reporter;
/// The tick loop assigning subtasks to agents and retrying failures.
pub mod scheduler;
/// Durable storage for tasks, agents, and subtask executions.
pub mod store;
/// Request validation for task creation.
pub mod validation;

pub use error::{CoreError, Result};
