//! Presence is a pure function of `(last_heartbeat, current_task_id, now)` —
//! it is never a stored column (spec §4.2, Design Notes: "Dynamic ... status
//! field"). Computing it here rather than persisting it means there is
//! nothing to keep in sync when an agent's assignment or heartbeat changes.

use crate::constants::PRESENCE_REAPER_INTERVAL_SECS;
use crate::event_bus::{Event, EventBus};
use crate::models::{Agent, Presence};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// `timeout_secs` is the controller's derived presence timeout
/// ([`crate::config::SchedulerConfig::presence_timeout_secs`]), not a
/// constant, since it scales with the configured heartbeat interval.
pub fn derive(agent: &Agent, now: DateTime<Utc>, timeout_secs: u64) -> Presence {
    let elapsed = (now - agent.last_heartbeat).num_seconds();
    if elapsed < 0 || elapsed as u64 > timeout_secs {
        return Presence::Offline;
    }
    match agent.assignment() {
        Some(_) => Presence::Busy,
        None => Presence::Free,
    }
}

/// Background task that polls agent presence purely to emit `agent_lost` /
/// `agent_reappeared` lifecycle events. It never mutates an agent row —
/// presence has no column to mutate.
pub async fn run_reaper(store: Arc<Store>, events: Arc<EventBus>, timeout_secs: u64) {
    let mut previously_offline = std::collections::HashSet::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(PRESENCE_REAPER_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        let agents = match store.list_agents() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "presence reaper failed to list agents");
                continue;
            }
        };
        let now = Utc::now();
        for agent in agents {
            let offline = derive(&agent, now, timeout_secs) == Presence::Offline;
            let was_offline = previously_offline.contains(&agent.name);
            if offline && !was_offline {
                previously_offline.insert(agent.name.clone());
                events.publish(Event::AgentLost { name: agent.name.clone() });
            } else if !offline && was_offline {
                previously_offline.remove(&agent.name);
                events.publish(Event::AgentReappeared { name: agent.name.clone() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fingerprint;
    use std::collections::HashSet as StdHashSet;

    fn agent(last_heartbeat: DateTime<Utc>, assignment: Option<(i64, i64)>) -> Agent {
        Agent {
            name: "a1".into(),
            address: "127.0.0.1:9000".into(),
            capabilities: StdHashSet::new(),
            last_heartbeat,
            last_config_update: Utc::now(),
            fingerprint: Fingerprint::default(),
            current_task_id: assignment.map(|(t, _)| t),
            current_subtask_id: assignment.map(|(_, s)| s),
        }
    }

    #[test]
    fn fresh_heartbeat_and_no_assignment_is_free() {
        let a = agent(Utc::now(), None);
        assert_eq!(derive(&a, Utc::now(), 90), Presence::Free);
    }

    #[test]
    fn fresh_heartbeat_with_assignment_is_busy() {
        let a = agent(Utc::now(), Some((1, 2)));
        assert_eq!(derive(&a, Utc::now(), 90), Presence::Busy);
    }

    #[test]
    fn stale_heartbeat_is_offline_even_if_assigned() {
        let a = agent(Utc::now() - chrono::Duration::seconds(200), Some((1, 2)));
        assert_eq!(derive(&a, Utc::now(), 90), Presence::Offline);
    }

    #[test]
    fn exactly_at_the_timeout_boundary_is_still_online() {
        let now = Utc::now();
        let a = agent(now - chrono::Duration::seconds(90), None);
        assert_eq!(derive(&a, now, 90), Presence::Free);
    }
}
