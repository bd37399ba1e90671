//! In-process pub/sub plus the agent-facing push transport ("rooms").
//!
//! Two distinct channels live here, both described in spec §4.3:
//! - a typed broadcast of lifecycle [`Event`]s, consumed by anything that
//!   wants to observe state changes (the HTTP layer, the monitoring
//!   snapshot, tests);
//! - a per-agent outbound mailbox ("room") used to push [`AgentMessage`]s to
//!   a specific connected agent. Rooms are strictly in-process; the only
//!   cross-process hop is the WebSocket connection each room is bound to.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::{broadcast, mpsc};

/// Lifecycle events published after a Store mutation commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    TaskCreated { task_id: i64 },
    TaskUpdated { task_id: i64 },
    TaskCancelled { task_id: i64 },
    TaskCompleted { task_id: i64 },
    SubtaskDispatched { task_id: i64, execution_id: i64 },
    SubtaskUpdated { execution_id: i64 },
    SubtaskCompleted { execution_id: i64 },
    AgentRegistered { name: String },
    AgentConfigUpdated { name: String },
    AgentLost { name: String },
    AgentReappeared { name: String },
    Heartbeat { name: String },
}

/// Envelope pushed over an agent's persistent channel, identical on both
/// directions (spec §4.3, §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum AgentMessage {
    SubtaskDispatch {
        task_id: i64,
        subtask_id: i64,
        subtask_name: String,
        order: i64,
        args: serde_json::Value,
        kwargs: serde_json::Value,
        timeout: u64,
    },
    TaskCancelled {
        task_id: i64,
    },
    Ping,
    Pong {
        fingerprint: serde_json::Value,
    },
    JoinRoom {
        name: String,
    },
    LeaveRoom {
        name: String,
    },
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    events_tx: broadcast::Sender<Event>,
    rooms: RwLock<HashMap<String, mpsc::UnboundedSender<AgentMessage>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events_tx,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Publish a lifecycle event. Silently dropped if nobody is subscribed —
    /// this is an observability fan-out, not a delivery guarantee.
    pub fn publish(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Register the outbound mailbox for an agent's room, replacing any
    /// previous one (a reconnect). The returned receiver half is driven by
    /// the WebSocket handler that owns the actual socket.
    pub fn join_room(&self, agent_name: &str) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms
            .write()
            .unwrap()
            .insert(agent_name.to_string(), tx);
        rx
    }

    pub fn leave_room(&self, agent_name: &str) {
        self.rooms.write().unwrap().remove(agent_name);
    }

    pub fn is_connected(&self, agent_name: &str) -> bool {
        self.rooms.read().unwrap().contains_key(agent_name)
    }

    /// Send a message into an agent's room. At-most-once: fails synchronously
    /// with [`CoreError::Transient`] if the agent has no live connection, per
    /// spec §4.3. Callers (the Scheduler/Dispatcher) are expected to retry or
    /// reassign on failure, not to treat this as fatal.
    pub fn send_to_room(&self, agent_name: &str, message: AgentMessage) -> Result<()> {
        let rooms = self.rooms.read().unwrap();
        match rooms.get(agent_name) {
            Some(tx) => tx
                .send(message)
                .map_err(|_| CoreError::Transient(format!("room for {agent_name} closed"))),
            None => Err(CoreError::Transient(format!(
                "agent {agent_name} has no connected room"
            ))),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_disconnected_room_fails_transiently() {
        let bus = EventBus::new();
        let result = bus.send_to_room("ghost", AgentMessage::Ping);
        assert!(matches!(result, Err(CoreError::Transient(_))));
    }

    #[test]
    fn joining_a_room_allows_send_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.join_room("a1");
        bus.send_to_room("a1", AgentMessage::Ping).unwrap();
        assert!(matches!(rx.try_recv(), Ok(AgentMessage::Ping)));
    }

    #[test]
    fn leaving_a_room_makes_it_disconnected() {
        let bus = EventBus::new();
        let _rx = bus.join_room("a1");
        assert!(bus.is_connected("a1"));
        bus.leave_room("a1");
        assert!(!bus.is_connected("a1"));
        assert!(bus.send_to_room("a1", AgentMessage::Ping).is_err());
    }

    #[tokio::test]
    async fn events_fan_out_to_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(Event::AgentRegistered {
            name: "a1".to_string(),
        });
        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert!(matches!(e1, Event::AgentRegistered { .. }));
        assert!(matches!(e2, Event::AgentRegistered { .. }));
    }
}
