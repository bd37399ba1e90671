//! Hands one dispatched subtask to the transport (spec §4.5). Stateless: the
//! authoritative record is always the `SubtaskExecution` row the Scheduler
//! already wrote: this component only confirms delivery or reports failure.

use crate::error::Result;
use crate::event_bus::{AgentMessage, EventBus};
use crate::models::{Subtask, SubtaskExecution};
use std::sync::Arc;

pub struct Dispatcher {
    events: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    /// Returns `Ok(())` only once the transport has confirmed delivery to
    /// the agent's room; any other outcome is the Scheduler's cue to roll
    /// back the row it just created.
    pub fn dispatch(&self, execution: &SubtaskExecution, subtask: &Subtask) -> Result<()> {
        self.events.send_to_room(
            &execution.agent_name,
            AgentMessage::SubtaskDispatch {
                task_id: execution.task_id,
                subtask_id: execution.id,
                subtask_name: subtask.name.clone(),
                order: subtask.order,
                args: subtask.args.clone(),
                kwargs: subtask.kwargs.clone(),
                timeout: subtask.timeout_seconds,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn execution() -> SubtaskExecution {
        SubtaskExecution {
            id: 1,
            task_id: 1,
            subtask_name: "ping".into(),
            order: 0,
            agent_name: "a1".into(),
            status: crate::models::ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            execution_seconds: None,
            attempt_index: 0,
        }
    }

    fn subtask() -> Subtask {
        Subtask {
            name: "ping".into(),
            target_agent: "a1".into(),
            order: 0,
            args: serde_json::Value::Null,
            kwargs: serde_json::Value::Null,
            timeout_seconds: 30,
            max_retries: 0,
            stop_on_failure: false,
        }
    }

    #[test]
    fn fails_synchronously_when_agent_not_connected() {
        let bus = Arc::new(EventBus::new());
        let dispatcher = Dispatcher::new(bus);
        assert!(dispatcher.dispatch(&execution(), &subtask()).is_err());
    }

    #[test]
    fn succeeds_once_the_agent_has_joined_its_room() {
        let bus = Arc::new(EventBus::new());
        let _rx = bus.join_room("a1");
        let dispatcher = Dispatcher::new(bus);
        let _ = Utc::now();
        assert!(dispatcher.dispatch(&execution(), &subtask()).is_ok());
    }
}
