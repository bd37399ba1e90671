//! Periodic operator-visible snapshot of queue depth, agent presence mix,
//! and completion rate (spec §6.1 "ambient supplement"). This is purely a
//! logging loop; the same figures are computed on demand by the `/api/metrics`
//! handler for programmatic consumers.

use crate::models::{Presence, TaskStatus};
use crate::presence;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

pub struct Monitor {
    store: Arc<Store>,
    presence_timeout_secs: u64,
}

impl Monitor {
    pub fn new(store: Arc<Store>, presence_timeout_secs: u64) -> Self {
        Self {
            store,
            presence_timeout_secs,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(crate::constants::MONITORING_SNAPSHOT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            match self.snapshot() {
                Ok(snapshot) => tracing::info!(
                    queue_depth = snapshot.queue_depth,
                    agents_free = snapshot.agents_free,
                    agents_busy = snapshot.agents_busy,
                    agents_offline = snapshot.agents_offline,
                    completion_rate = snapshot.completion_rate,
                    health = ?snapshot.health,
                    "monitoring snapshot"
                ),
                Err(e) => tracing::warn!(error = %e, "failed to compute monitoring snapshot"),
            }
        }
    }

    pub fn snapshot(&self) -> crate::error::Result<Snapshot> {
        let tasks = self.store.list_tasks()?;
        let queue_depth = tasks.iter().filter(|t| t.status == TaskStatus::Pending).count();
        let terminal: Vec<_> = tasks.iter().filter(|t| t.status.is_terminal()).collect();
        let completion_rate = if terminal.is_empty() {
            1.0
        } else {
            terminal.iter().filter(|t| t.status == TaskStatus::Completed).count() as f64 / terminal.len() as f64
        };

        let now = chrono::Utc::now();
        let (mut free, mut busy, mut offline) = (0, 0, 0);
        for agent in self.store.list_agents()? {
            match presence::derive(&agent, now, self.presence_timeout_secs) {
                Presence::Free => free += 1,
                Presence::Busy => busy += 1,
                Presence::Offline => offline += 1,
            }
        }

        let health = if self.store.list_tasks().is_err() {
            HealthStatus::Unhealthy
        } else if offline > 0 && offline >= free + busy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(Snapshot {
            queue_depth,
            agents_free: free,
            agents_busy: busy,
            agents_offline: offline,
            completion_rate,
            health,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub queue_depth: usize,
    pub agents_free: usize,
    pub agents_busy: usize,
    pub agents_offline: usize,
    pub completion_rate: f64,
    pub health: HealthStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;

    #[test]
    fn snapshot_on_an_empty_store_is_healthy_with_full_completion_rate() {
        let store = Arc::new(Store::open(":memory:", Arc::new(EventBus::new())).unwrap());
        let monitor = Monitor::new(store, 90);
        let snapshot = monitor.snapshot().unwrap();
        assert_eq!(snapshot.queue_depth, 0);
        assert_eq!(snapshot.completion_rate, 1.0);
        assert_eq!(snapshot.health, HealthStatus::Healthy);
    }
}
