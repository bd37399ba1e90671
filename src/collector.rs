//! Ingests subtask outcomes reported by agents and decides task completion
//! (spec §4.6). The public methods here are exactly the endpoints the HTTP
//! layer exposes to agents; this module holds no transport concerns of its
//! own.

use crate::error::{CoreError, Result};
use crate::event_bus::{Event, EventBus};
use crate::models::{AgentSummary, ExecutionStatus, Subtask, SubtaskSummary, Task, TaskStatus, TaskSummary};
use crate::reporter::Reporter;
use crate::scheduler::Scheduler;
use crate::store::{NewExecution, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

pub struct Collector {
    store: Arc<Store>,
    events: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    reporter: Arc<dyn Reporter>,
    /// One lock per task id, so the completion check is linearized per spec
    /// §4.6.1's "race rule" without serializing unrelated tasks against each
    /// other.
    task_locks: AsyncMutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl Collector {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>, scheduler: Arc<Scheduler>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            store,
            events,
            scheduler,
            reporter,
            task_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, task_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.task_locks.lock().await;
        locks.entry(task_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// `subtask_started(task_id, subtask_name, agent)`. Purely diagnostic —
    /// the row is already RUNNING by the time the Scheduler dispatched it;
    /// this just confirms the agent picked it up.
    pub fn subtask_started(&self, task_id: i64, subtask_name: &str, agent: &str) -> Result<()> {
        tracing::debug!(task_id, subtask_name, agent, "agent confirmed subtask start");
        Ok(())
    }

    /// `subtask_progress(...)` — optional, logged only.
    pub fn subtask_progress(&self, task_id: i64, subtask_name: &str, agent: &str, message: &str) {
        tracing::debug!(task_id, subtask_name, agent, message, "subtask progress");
    }

    /// `task_unreachable(task_id, agent)` — optional diagnostic an agent may
    /// send if it cannot complete a subtask because its own watchdog expired
    /// before it could report properly. Logged only; the Scheduler's own
    /// offline/grace handling is authoritative.
    pub fn task_unreachable(&self, task_id: i64, agent: &str) {
        tracing::warn!(task_id, agent, "agent reported task unreachable");
    }

    /// `subtask_result(task_id, subtask_name, agent, status, result?, error?, elapsed)`
    /// (spec §4.6).
    pub async fn subtask_result(
        &self,
        task_id: i64,
        subtask_name: &str,
        agent: &str,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        elapsed: Option<f64>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(CoreError::InvalidInput(format!(
                "subtask_result status must be terminal, got {status}"
            )));
        }

        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        let subtask = task
            .subtasks
            .iter()
            .find(|s| s.name == subtask_name && s.target_agent == agent)
            .ok_or_else(|| {
                CoreError::InvalidInput(format!("task {task_id} has no subtask '{subtask_name}' for agent '{agent}'"))
            })?;

        let row = match self.store.get_running_execution(task_id, subtask_name, agent)? {
            Some(row) => row,
            None => {
                tracing::warn!(
                    task_id, subtask_name, agent,
                    "lost-and-found: subtask_result with no matching RUNNING row, recording anomaly"
                );
                let observed_attempt = self
                    .store
                    .get_executions_for(task_id, Some(subtask_name), Some(agent))?
                    .last()
                    .map(|r| r.attempt_index + 1)
                    .unwrap_or(0);
                self.store.create_terminal_execution(
                    NewExecution {
                        task_id,
                        subtask_name: subtask_name.to_string(),
                        order: subtask.order,
                        agent_name: agent.to_string(),
                        attempt_index: observed_attempt,
                    },
                    status,
                    error.as_deref().unwrap_or("lost-and-found: no RUNNING row at result time"),
                )?;
                self.store.clear_assignment(agent)?;
                self.check_completion(task_id).await?;
                return Ok(());
            }
        };

        // Idempotent: a replay of the same (row_id, status) is a no-op —
        // `update_execution` already absorbs this.
        self.store.update_execution(
            row.id,
            status,
            row.started_at,
            Some(Utc::now()),
            result,
            error,
            elapsed,
        )?;
        self.store.clear_assignment(agent)?;
        self.scheduler.clear_cancel_deadline(row.id);
        self.events.publish(Event::SubtaskCompleted { execution_id: row.id });

        self.check_completion(task_id).await
    }

    /// Task-completion predicate and verdict (spec §4.6.1), linearized per
    /// task so a race between two result callbacks commits at most one
    /// transition.
    async fn check_completion(&self, task_id: i64) -> Result<()> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let task = match self.store.get_task(task_id)? {
            Some(t) => t,
            None => return Ok(()),
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        let executions = self.store.get_executions_for(task_id, None, None)?;
        let mut pairs: HashMap<(String, String), Vec<_>> = HashMap::new();
        for subtask in &task.subtasks {
            pairs.entry((subtask.name.clone(), subtask.target_agent.clone())).or_default();
        }
        for row in &executions {
            pairs
                .entry((row.subtask_name.clone(), row.agent_name.clone()))
                .or_default()
                .push(row);
        }

        let now = Utc::now();
        let mut all_done = true;
        let mut all_succeeded = true;
        for ((subtask_name, agent_name), rows) in pairs.iter_mut() {
            rows.sort_by_key(|r| r.id);
            match rows.last() {
                None => {
                    all_done = false;
                }
                Some(latest) if !latest.status.is_terminal() => {
                    all_done = false;
                }
                Some(latest) if latest.status == ExecutionStatus::Failed => {
                    // Terminal-Failed is not yet "done" while a retry is still
                    // owed: attempts remain and the agent hasn't gone past its
                    // grace window (spec §4.6.1, mirrors the Scheduler's own
                    // retry-eligibility check in `handle_failed_chain_link`).
                    let subtask = task
                        .subtasks
                        .iter()
                        .find(|s| &s.name == subtask_name && &s.target_agent == agent_name);
                    let retries_remain =
                        subtask.is_some_and(|s| latest.attempt_index < s.max_retries);
                    let agent_in_grace = self
                        .store
                        .get_agent(agent_name)?
                        .is_some_and(|a| !self.scheduler.offline_past_grace(&a, now));
                    if retries_remain && agent_in_grace {
                        all_done = false;
                    } else {
                        all_succeeded = false;
                    }
                }
                Some(latest) if latest.status != ExecutionStatus::Completed => {
                    all_succeeded = false;
                }
                Some(_) => {}
            }
        }

        if !all_done {
            return Ok(());
        }

        let verdict = if all_succeeded { TaskStatus::Completed } else { TaskStatus::Failed };
        self.store.update_task_status(task_id, verdict, now, None, None)?;

        let summary = build_summary(&task, verdict, &executions, now);
        self.events.publish(Event::TaskCompleted { task_id });
        self.reporter.on_task_completed(&summary).await;
        Ok(())
    }
}

fn build_summary(
    task: &Task,
    verdict: TaskStatus,
    executions: &[crate::models::SubtaskExecution],
    completed_at: chrono::DateTime<Utc>,
) -> TaskSummary {
    let mut by_agent: HashMap<&str, Vec<&Subtask>> = HashMap::new();
    for subtask in &task.subtasks {
        by_agent.entry(subtask.target_agent.as_str()).or_default().push(subtask);
    }

    let per_agent = by_agent
        .into_iter()
        .map(|(agent, subtasks)| {
            let mut summaries = Vec::new();
            let mut successful = 0u32;
            for subtask in &subtasks {
                let mut rows: Vec<_> = executions
                    .iter()
                    .filter(|r| r.subtask_name == subtask.name && r.agent_name == agent)
                    .collect();
                rows.sort_by_key(|r| r.id);
                let attempts = rows.len() as u32;
                if let Some(latest) = rows.last() {
                    if latest.status == ExecutionStatus::Completed {
                        successful += 1;
                    }
                    summaries.push(SubtaskSummary {
                        name: subtask.name.clone(),
                        order: subtask.order,
                        status: latest.status,
                        result: latest.result.clone(),
                        error: latest.error.clone(),
                        elapsed: latest.execution_seconds,
                        attempts,
                    });
                }
            }
            AgentSummary {
                agent: agent.to_string(),
                overall_success: successful as usize == subtasks.len(),
                successful,
                total: subtasks.len() as u32,
                subtasks: summaries,
            }
        })
        .collect();

    TaskSummary {
        task_id: task.id,
        name: task.name.clone(),
        verdict,
        started_at: task.started_at,
        completed_at,
        elapsed: task.started_at.map(|s| (completed_at - s).num_milliseconds() as f64 / 1000.0),
        per_agent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::models::{CreateTaskRequest, Fingerprint};
    use std::collections::HashSet;

    fn harness() -> (Arc<Store>, Arc<Scheduler>, Collector) {
        let events = Arc::new(EventBus::new());
        let store = Arc::new(Store::open(":memory:", events.clone()).unwrap());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            events.clone(),
            &SchedulerConfig {
                tick_interval_secs: 1,
                heartbeat_interval_secs: 10,
                agent_grace_period_secs: 30,
                cancel_grace_secs: 30,
            },
            90,
        ));
        let collector = Collector::new(store.clone(), events, scheduler.clone(), Arc::new(crate::reporter::LoggingReporter));
        (store, scheduler, collector)
    }

    fn one_subtask_task(store: &Store) -> i64 {
        store
            .register_agent("a1", "10.0.0.1:9000", &HashSet::new(), &Fingerprint::default())
            .unwrap();
        store
            .create_task(CreateTaskRequest {
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
            })
            .unwrap()
    }

    /// Puts a subtask execution into RUNNING, mirroring what the Scheduler
    /// does on successful dispatch.
    fn dispatch_running(store: &Store, task_id: i64) -> crate::models::SubtaskExecution {
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
        execution
    }

    #[tokio::test]
    async fn a_single_subtask_success_completes_the_task() {
        let (store, _scheduler, collector) = harness();
        let task_id = one_subtask_task(&store);
        dispatch_running(&store, task_id);

        collector
            .subtask_result(
                task_id,
                "get_hostname",
                "a1",
                ExecutionStatus::Completed,
                Some(serde_json::json!({ "hostname": "box1" })),
                None,
                Some(0.1),
            )
            .await
            .unwrap();

        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn a_single_subtask_failure_fails_the_task() {
        let (store, _scheduler, collector) = harness();
        let task_id = one_subtask_task(&store);
        dispatch_running(&store, task_id);

        collector
            .subtask_result(task_id, "get_hostname", "a1", ExecutionStatus::Failed, None, Some("boom".into()), Some(0.1))
            .await
            .unwrap();

        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn a_failed_attempt_with_retries_remaining_does_not_fail_the_task_yet() {
        let (store, _scheduler, collector) = harness();
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
                    timeout_seconds: 30,
                    max_retries: 2,
                    stop_on_failure: false,
                }],
                schedule_time: None,
                cron_expression: None,
                send_email: false,
                email_recipients: vec![],
                max_retries: 0,
            })
            .unwrap();
        dispatch_running(&store, task_id);

        collector
            .subtask_result(task_id, "get_hostname", "a1", ExecutionStatus::Failed, None, Some("boom".into()), Some(0.1))
            .await
            .unwrap();

        let task = store.get_task(task_id).unwrap().unwrap();
        assert_ne!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn result_clears_the_agents_assignment_slot() {
        let (store, _scheduler, collector) = harness();
        let task_id = one_subtask_task(&store);
        dispatch_running(&store, task_id);

        collector
            .subtask_result(task_id, "get_hostname", "a1", ExecutionStatus::Completed, None, None, None)
            .await
            .unwrap();

        let agent = store.get_agent("a1").unwrap().unwrap();
        assert!(agent.assignment().is_none());
    }

    #[tokio::test]
    async fn result_rejects_a_non_terminal_status() {
        let (store, _scheduler, collector) = harness();
        let task_id = one_subtask_task(&store);
        dispatch_running(&store, task_id);

        let result = collector
            .subtask_result(task_id, "get_hostname", "a1", ExecutionStatus::Running, None, None, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn a_result_with_no_matching_running_row_is_recorded_as_an_anomaly_without_erroring() {
        let (store, _scheduler, collector) = harness();
        let task_id = one_subtask_task(&store);
        // no dispatch_running call: no RUNNING row exists yet.

        collector
            .subtask_result(task_id, "get_hostname", "a1", ExecutionStatus::Completed, None, Some("late".into()), None)
            .await
            .unwrap();

        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn result_for_unknown_task_is_rejected() {
        let (_store, _scheduler, collector) = harness();
        let result = collector
            .subtask_result(999, "get_hostname", "a1", ExecutionStatus::Completed, None, None, None)
            .await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }
}
