//! The tick loop that turns pending tasks into dispatched subtasks (spec
//! §4.4). Owns no durable state of its own — every decision is read fresh
//! from the Store each tick, so a restart loses nothing but in-flight
//! cancellation grace timers, which are harmless to redo.

pub mod cron;

use crate::config::SchedulerConfig;
use crate::constants::{RETRY_BACKOFF_BASE_SECS, RETRY_BACKOFF_CAP_SECS, RETRY_BACKOFF_FACTOR};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::event_bus::{AgentMessage, EventBus};
use crate::models::{Agent, ExecutionStatus, Presence, Subtask, SubtaskExecution, Task, TaskStatus};
use crate::store::{NewExecution, Store};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Scheduler {
    store: Arc<Store>,
    events: Arc<EventBus>,
    dispatcher: Dispatcher,
    tick_interval_secs: u64,
    agent_grace_period_secs: u64,
    cancel_grace_secs: u64,
    presence_timeout_secs: u64,
    /// Execution id -> deadline for a RUNNING row that's awaiting a
    /// cancellation acknowledgement (spec §4.4.3). In-memory only; lost on
    /// restart, which just means an in-flight cancel grace window restarts.
    cancel_deadlines: Mutex<HashMap<i64, DateTime<Utc>>>,
    /// Timestamp of the last completed tick, whether or not it errored.
    /// Exposed via [`Self::last_tick_age_secs`] for the `/api/health` probe
    /// (spec §6.1: "liveness/readiness (store reachable, scheduler tick age)").
    last_tick: Mutex<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventBus>,
        config: &SchedulerConfig,
        presence_timeout_secs: u64,
    ) -> Self {
        Self {
            store: store.clone(),
            dispatcher: Dispatcher::new(events.clone()),
            events,
            tick_interval_secs: config.tick_interval_secs,
            agent_grace_period_secs: config.agent_grace_period_secs,
            cancel_grace_secs: config.cancel_grace_secs,
            presence_timeout_secs,
            cancel_deadlines: Mutex::new(HashMap::new()),
            last_tick: Mutex::new(Utc::now()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.tick_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick() {
                tracing::warn!(error = %e, "scheduler tick failed");
            }
            *self.last_tick.lock().unwrap() = Utc::now();
        }
    }

    /// Seconds since the last completed tick. Large values indicate the
    /// scheduler loop is stuck or was never started.
    pub fn last_tick_age_secs(&self) -> i64 {
        (Utc::now() - *self.last_tick.lock().unwrap()).num_seconds()
    }

    pub fn tick_interval_secs(&self) -> u64 {
        self.tick_interval_secs
    }

    /// Marks a RUNNING row's cancellation as acknowledged; called by the
    /// Result Collector whenever it commits a terminal transition, whether
    /// or not that row was actually awaiting cancellation.
    pub fn clear_cancel_deadline(&self, execution_id: i64) {
        self.cancel_deadlines.lock().unwrap().remove(&execution_id);
    }

    /// `cancel_task(id)` (spec §4.4.3).
    pub fn cancel_task(&self, task_id: i64) -> Result<()> {
        self.store
            .update_task_status(task_id, TaskStatus::Cancelled, Utc::now(), None, None)?;
        let running = self.store.cancel_task_executions(task_id)?;
        let deadline = Utc::now() + chrono::Duration::seconds(self.cancel_grace_secs as i64);
        let mut deadlines = self.cancel_deadlines.lock().unwrap();
        for row in running {
            let _ = self
                .events
                .send_to_room(&row.agent_name, AgentMessage::TaskCancelled { task_id });
            deadlines.insert(row.id, deadline);
        }
        Ok(())
    }

    fn force_expired_cancellations(&self) -> Result<()> {
        let now = Utc::now();
        let expired: Vec<i64> = {
            let deadlines = self.cancel_deadlines.lock().unwrap();
            deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        for execution_id in expired {
            if let Some(row) = self.store.get_execution(execution_id)? {
                if !row.status.is_terminal() {
                    self.store.update_execution(
                        execution_id,
                        ExecutionStatus::Cancelled,
                        row.started_at,
                        Some(now),
                        None,
                        Some("cancellation grace period expired".into()),
                        None,
                    )?;
                    self.store.clear_assignment(&row.agent_name)?;
                }
            }
            self.cancel_deadlines.lock().unwrap().remove(&execution_id);
        }
        Ok(())
    }

    /// An agent counts as gone-for-good once it has been presence-`OFFLINE`
    /// (heartbeat age past the presence `TIMEOUT`) for longer than
    /// `agent_grace_period` *on top of* that timeout — total elapsed since
    /// the last heartbeat must exceed `TIMEOUT + grace` (spec §4.4.2, S3).
    pub(crate) fn offline_past_grace(&self, agent: &Agent, now: DateTime<Utc>) -> bool {
        if crate::presence::derive(agent, now, self.presence_timeout_secs) != Presence::Offline {
            return false;
        }
        let elapsed = (now - agent.last_heartbeat).num_seconds();
        let offline_elapsed = elapsed - self.presence_timeout_secs as i64;
        offline_elapsed > self.agent_grace_period_secs as i64
    }

    /// Offline-agent housekeeping: any PENDING/RUNNING row whose target
    /// agent has been offline longer than `agent_grace_period` fails
    /// outright with no further retry (spec §4.4.2).
    fn fail_rows_stuck_on_offline_agents(&self, agents: &HashMap<String, Agent>) -> Result<()> {
        let now = Utc::now();
        for task in self.store.list_tasks()? {
            if task.status.is_terminal() {
                continue;
            }
            for row in self.store.get_executions_for(task.id, None, None)? {
                if row.status.is_terminal() {
                    continue;
                }
                let Some(agent) = agents.get(&row.agent_name) else {
                    continue;
                };
                if !self.offline_past_grace(agent, now) {
                    continue;
                }
                self.store.update_execution(
                    row.id,
                    ExecutionStatus::Failed,
                    row.started_at,
                    Some(now),
                    None,
                    Some("no-agent".into()),
                    None,
                )?;
                self.store.clear_assignment(&row.agent_name)?;
            }
        }
        Ok(())
    }

    /// Controller-side safety net for a RUNNING row whose agent never reports
    /// back: the agent's own watchdog is authoritative, but if it silently
    /// wedges past `dispatched_at + timeout + grace`, force-fail the row
    /// rather than block the chain forever (spec §5).
    fn fail_rows_exceeding_timeout(&self) -> Result<()> {
        let now = Utc::now();
        for task in self.store.list_tasks()? {
            if task.status.is_terminal() {
                continue;
            }
            for row in self.store.get_executions_for(task.id, None, None)? {
                if row.status != ExecutionStatus::Running {
                    continue;
                }
                let Some(started_at) = row.started_at else { continue };
                let Some(subtask) = task.subtasks.iter().find(|s| s.name == row.subtask_name) else {
                    continue;
                };
                let deadline_secs =
                    subtask.timeout_seconds + crate::constants::DISPATCH_TIMEOUT_GRACE_SECS;
                if (now - started_at).num_seconds() as u64 <= deadline_secs {
                    continue;
                }
                tracing::warn!(
                    task_id = task.id,
                    execution_id = row.id,
                    subtask = %row.subtask_name,
                    "subtask exceeded timeout+grace with no result, force-failing"
                );
                self.store.update_execution(
                    row.id,
                    ExecutionStatus::Failed,
                    row.started_at,
                    Some(now),
                    None,
                    Some("timeout".into()),
                    None,
                )?;
                self.store.clear_assignment(&row.agent_name)?;
            }
        }
        Ok(())
    }

    /// One full pass over the pending/cron-due task set (spec §4.4 steps
    /// 1-3).
    pub fn tick(&self) -> Result<()> {
        self.force_expired_cancellations()?;

        let agents: HashMap<String, Agent> = self
            .store
            .list_agents()?
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();

        self.fail_rows_stuck_on_offline_agents(&agents)?;
        self.fail_rows_exceeding_timeout()?;

        let now = Utc::now();
        self.rearm_due_cron_tasks(now)?;
        self.arm_first_cron_firings(now)?;

        let mut ready: Vec<Task> = self
            .store
            .list_tasks()?
            .into_iter()
            .filter(|t| {
                (t.status == TaskStatus::Pending && self.is_due(t, now)) || t.status == TaskStatus::Running
            })
            .collect();
        ready.sort_by(|a, b| {
            (a.schedule_time, a.created_at, a.id).cmp(&(b.schedule_time, b.created_at, b.id))
        });

        for task in ready {
            if let Err(e) = self.process_task(&task, &agents, now) {
                tracing::warn!(task_id = task.id, error = %e, "scheduler failed to process task");
            }
        }
        Ok(())
    }

    fn is_due(&self, task: &Task, now: DateTime<Utc>) -> bool {
        match &task.cron_expression {
            Some(_) => task.cron_fired_at.map(|fired| fired <= now).unwrap_or(false),
            None => task.schedule_time.unwrap_or(now) <= now,
        }
    }

    /// Stamps a never-yet-fired cron task with its first occurrence once
    /// that time has passed (spec §4.4.5).
    fn arm_first_cron_firings(&self, now: DateTime<Utc>) -> Result<()> {
        for task in self.store.list_tasks()? {
            if task.status != TaskStatus::Pending
                || task.cron_fired_at.is_some()
                || task.cron_expression.is_none()
            {
                continue;
            }
            let expr = task.cron_expression.as_ref().unwrap();
            let first_fire = cron::next_fire_after(expr, task.created_at)?;
            if first_fire <= now {
                if let Err(e) = self.store.mark_cron_fired(task.id, first_fire) {
                    tracing::debug!(task_id = task.id, error = %e, "cron arm race, skipping");
                }
            }
        }
        Ok(())
    }

    fn rearm_due_cron_tasks(&self, now: DateTime<Utc>) -> Result<()> {
        for task in self.store.list_tasks()? {
            let Some(expr) = &task.cron_expression else { continue };
            if !task.status.is_terminal() {
                tracing::debug!(task_id = task.id, "cron firing overlaps a still-running instance, skipping rearm");
                continue;
            }
            let last_fire = task.cron_fired_at.unwrap_or(task.created_at);
            let next_fire = cron::next_fire_after(expr, last_fire)?;
            if next_fire <= now {
                if let Err(e) = self.store.rearm_cron_task(task.id, next_fire) {
                    tracing::warn!(task_id = task.id, error = %e, "failed to rearm cron task");
                }
            }
        }
        Ok(())
    }

    fn process_task(&self, task: &Task, agents: &HashMap<String, Agent>, now: DateTime<Utc>) -> Result<()> {
        let mut by_agent: HashMap<&str, Vec<&Subtask>> = HashMap::new();
        for subtask in &task.subtasks {
            by_agent.entry(subtask.target_agent.as_str()).or_default().push(subtask);
        }
        for subtasks in by_agent.values_mut() {
            subtasks.sort_by_key(|s| s.order);
        }

        let mut task_became_running = false;
        for (agent_name, chain) in by_agent {
            let mut upstream_skipped = false;
            for subtask in chain {
                let history =
                    self.store.get_executions_for(task.id, Some(&subtask.name), Some(agent_name))?;
                let Some(latest) = history.last() else {
                    if upstream_skipped {
                        self.skip_subtask(task.id, subtask, agent_name, 0)?;
                        continue;
                    }
                    if self.try_dispatch(task, subtask, agent_name, agents, 0, now)? {
                        task_became_running = true;
                    }
                    break;
                };
                match latest.status {
                    ExecutionStatus::Completed => continue,
                    ExecutionStatus::Pending | ExecutionStatus::Running => break,
                    ExecutionStatus::Cancelled => {
                        upstream_skipped = true;
                        continue;
                    }
                    ExecutionStatus::Failed => {
                        if let Some(outcome) =
                            self.handle_failed_chain_link(task, subtask, agent_name, latest, agents, now)?
                        {
                            if outcome {
                                task_became_running = true;
                            }
                            break;
                        }
                        // retries exhausted or stopped: chain continues past this link
                        if subtask.stop_on_failure {
                            upstream_skipped = true;
                        }
                        continue;
                    }
                }
            }
        }

        if task_became_running && task.status == TaskStatus::Pending {
            self.store.update_task_status(task.id, TaskStatus::Running, now, None, None)?;
        }
        Ok(())
    }

    fn skip_subtask(&self, task_id: i64, subtask: &Subtask, agent_name: &str, attempt_index: u32) -> Result<()> {
        self.store.create_terminal_execution(
            NewExecution {
                task_id,
                subtask_name: subtask.name.clone(),
                order: subtask.order,
                agent_name: agent_name.to_string(),
                attempt_index,
            },
            ExecutionStatus::Cancelled,
            "skipped after upstream failure",
        )?;
        Ok(())
    }

    /// Returns `Some(true)` if a fresh attempt was dispatched, `Some(false)`
    /// if the chain is blocked waiting on backoff or the agent, or `None` if
    /// this failure is final (retries exhausted / agent unreachable) and the
    /// caller should evaluate chain-continuation.
    fn handle_failed_chain_link(
        &self,
        task: &Task,
        subtask: &Subtask,
        agent_name: &str,
        latest: &SubtaskExecution,
        agents: &HashMap<String, Agent>,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        if latest.attempt_index >= subtask.max_retries {
            return Ok(None);
        }
        let Some(agent) = agents.get(agent_name) else {
            return Ok(None);
        };
        if self.offline_past_grace(agent, now) {
            return Ok(None);
        }
        let backoff = retry_backoff(latest.attempt_index);
        let retry_at = latest.completed_at.unwrap_or(now) + chrono::Duration::seconds(backoff as i64);
        if retry_at > now {
            return Ok(Some(false));
        }
        let dispatched = self.try_dispatch(task, subtask, agent_name, agents, latest.attempt_index + 1, now)?;
        Ok(Some(dispatched))
    }

    fn try_dispatch(
        &self,
        task: &Task,
        subtask: &Subtask,
        agent_name: &str,
        agents: &HashMap<String, Agent>,
        attempt_index: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(agent) = agents.get(agent_name) else {
            return Ok(false);
        };
        if crate::presence::derive(agent, now, self.presence_timeout_secs) != Presence::Free {
            return Ok(false);
        }

        let execution = match self.store.assign_and_create_execution(NewExecution {
            task_id: task.id,
            subtask_name: subtask.name.clone(),
            order: subtask.order,
            agent_name: agent_name.to_string(),
            attempt_index,
        }) {
            Ok(row) => row,
            Err(crate::error::CoreError::Conflict(reason)) => {
                tracing::debug!(task_id = task.id, agent = agent_name, reason, "dispatch slot unavailable");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match self.dispatcher.dispatch(&execution, subtask) {
            Ok(()) => {
                self.store.update_execution(
                    execution.id,
                    ExecutionStatus::Running,
                    Some(now),
                    None,
                    None,
                    None,
                    None,
                )?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(task_id = task.id, agent = agent_name, error = %e, "dispatch failed, rolling back");
                self.store.rollback_assignment(execution.id, agent_name)?;
                Ok(false)
            }
        }
    }
}

/// Exponential backoff with a cap (spec §4.4.2: base 5s, factor 2, cap 5min).
fn retry_backoff(attempt_index: u32) -> u64 {
    RETRY_BACKOFF_BASE_SECS
        .saturating_mul(RETRY_BACKOFF_FACTOR.saturating_pow(attempt_index))
        .min(RETRY_BACKOFF_CAP_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::models::{CreateTaskRequest, Fingerprint};
    use crate::store::NewExecution;
    use std::collections::HashSet;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(0), 5);
        assert_eq!(retry_backoff(1), 10);
        assert_eq!(retry_backoff(2), 20);
        assert_eq!(retry_backoff(10), RETRY_BACKOFF_CAP_SECS);
    }

    fn agent_with_heartbeat_age(seconds: i64) -> Agent {
        Agent {
            name: "a1".into(),
            address: "127.0.0.1:9000".into(),
            capabilities: HashSet::new(),
            last_heartbeat: Utc::now() - chrono::Duration::seconds(seconds),
            last_config_update: Utc::now(),
            fingerprint: crate::models::Fingerprint::default(),
            current_task_id: None,
            current_subtask_id: None,
        }
    }

    #[test]
    fn offline_past_grace_requires_timeout_plus_grace_not_grace_alone() {
        let (_store, scheduler) = harness();
        // presence timeout 90s, grace 600s: 650s offline is past the old
        // (grace-only) threshold but not past TIMEOUT + grace (690s).
        assert!(!scheduler.offline_past_grace(&agent_with_heartbeat_age(650), Utc::now()));
        assert!(scheduler.offline_past_grace(&agent_with_heartbeat_age(700), Utc::now()));
    }

    #[test]
    fn offline_past_grace_is_false_for_an_agent_still_within_presence_timeout() {
        let (_store, scheduler) = harness();
        assert!(!scheduler.offline_past_grace(&agent_with_heartbeat_age(10), Utc::now()));
    }

    fn harness() -> (Arc<Store>, Scheduler) {
        let events = Arc::new(EventBus::new());
        let store = Arc::new(Store::open(":memory:", events.clone()).unwrap());
        let scheduler = Scheduler::new(
            store.clone(),
            events,
            &SchedulerConfig {
                tick_interval_secs: 1,
                heartbeat_interval_secs: 10,
                agent_grace_period_secs: 600,
                cancel_grace_secs: 30,
            },
            90,
        );
        (store, scheduler)
    }

    #[test]
    fn a_running_row_past_timeout_and_grace_is_force_failed() {
        let (store, scheduler) = harness();
        store
            .register_agent("a1", "10.0.0.1:9000", &HashSet::new(), &Fingerprint::default())
            .unwrap();
        let task_id = store
            .create_task(CreateTaskRequest {
                name: "t1".into(),
                subtasks: vec![Subtask {
                    name: "get_hostname".into(),
                    target_agent: "a1".into(),
                    order: 0,
                    args: serde_json::Value::Null,
                    kwargs: serde_json::Value::Null,
                    timeout_seconds: 5,
                    max_retries: 0,
                    stop_on_failure: false,
                }],
                schedule_time: None,
                cron_expression: None,
                send_email: false,
                email_recipients: vec![],
                max_retries: 0,
            })
            .unwrap();
        let execution = store
            .assign_and_create_execution(NewExecution {
                task_id,
                subtask_name: "get_hostname".into(),
                order: 0,
                agent_name: "a1".into(),
                attempt_index: 0,
            })
            .unwrap();
        let started_at = Utc::now() - chrono::Duration::seconds(1000);
        store
            .update_execution(execution.id, ExecutionStatus::Running, Some(started_at), None, None, None, None)
            .unwrap();

        scheduler.fail_rows_exceeding_timeout().unwrap();

        let row = store
            .get_executions_for(task_id, Some("get_hostname"), Some("a1"))
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn a_running_row_within_timeout_and_grace_is_left_alone() {
        let (store, scheduler) = harness();
        store
            .register_agent("a1", "10.0.0.1:9000", &HashSet::new(), &Fingerprint::default())
            .unwrap();
        let task_id = store
            .create_task(CreateTaskRequest {
                name: "t1".into(),
                subtasks: vec![Subtask {
                    name: "get_hostname".into(),
                    target_agent: "a1".into(),
                    order: 0,
                    args: serde_json::Value::Null,
                    kwargs: serde_json::Value::Null,
                    timeout_seconds: 600,
                    max_retries: 0,
                    stop_on_failure: false,
                }],
                schedule_time: None,
                cron_expression: None,
                send_email: false,
                email_recipients: vec![],
                max_retries: 0,
            })
            .unwrap();
        let execution = store
            .assign_and_create_execution(NewExecution {
                task_id,
                subtask_name: "get_hostname".into(),
                order: 0,
                agent_name: "a1".into(),
                attempt_index: 0,
            })
            .unwrap();
        store
            .update_execution(execution.id, ExecutionStatus::Running, Some(Utc::now()), None, None, None, None)
            .unwrap();

        scheduler.fail_rows_exceeding_timeout().unwrap();

        let row = store
            .get_executions_for(task_id, Some("get_hostname"), Some("a1"))
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Running);
    }
}
