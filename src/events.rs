//! Per-session push events.
//!
//! Events are tagged with `eventType` in their JSON form. The hub keeps one
//! broadcast channel per session and stamps every event with a process-wide
//! monotonic sequence number.

use crate::sessions::NormalizedMessage;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::debug;

/// What the agent process is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    #[default]
    Idle,
    Running,
    /// Blocked on a permission prompt or question
    WaitingInput,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "kebab-case")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Connected {
        state: AgentState,
        permission_mode: String,
        mode_version: u64,
    },
    Message(NormalizedMessage),
    Status {
        state: AgentState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ModeChange {
        permission_mode: String,
        mode_version: u64,
    },
    Complete,
    Heartbeat {
        timestamp: u64,
    },
    Error {
        message: String,
    },
}

impl SessionEvent {
    pub fn heartbeat() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        SessionEvent::Heartbeat { timestamp }
    }

    /// SSE `event:` name
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::Message(_) => "message",
            SessionEvent::Status { .. } => "status",
            SessionEvent::ModeChange { .. } => "mode-change",
            SessionEvent::Complete => "complete",
            SessionEvent::Heartbeat { .. } => "heartbeat",
            SessionEvent::Error { .. } => "error",
        }
    }
}

/// Last known agent status, replayed as the `connected` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub state: AgentState,
    pub permission_mode: String,
    pub mode_version: u64,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Idle,
            permission_mode: "default".to_string(),
            mode_version: 0,
        }
    }
}

pub type EventReceiver = broadcast::Receiver<(u64, SessionEvent)>;

pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<(u64, SessionEvent)>>,
    status: DashMap<String, AgentStatus>,
    seq: AtomicU64,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            status: DashMap::new(),
            seq: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Get next sequence number (ensures ordering)
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn subscribe(&self, session_id: &str) -> EventReceiver {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to every subscriber of `session_id`. Returns the event's sequence number.
    pub fn publish(&self, session_id: &str, event: SessionEvent) -> u64 {
        self.track_status(session_id, &event);
        let seq = self.next_seq();
        let delivered = self
            .channels
            .get(session_id)
            .map_or(0, |tx| tx.send((seq, event)).unwrap_or(0));
        debug!("Event {} for {} delivered to {} subscribers", seq, session_id, delivered);
        seq
    }

    /// The `connected` event a new subscriber should see first.
    pub fn connected(&self, session_id: &str) -> SessionEvent {
        let status = self
            .status
            .get(session_id)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        SessionEvent::Connected {
            state: status.state,
            permission_mode: status.permission_mode,
            mode_version: status.mode_version,
        }
    }

    /// Drop channels nobody listens to.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    fn track_status(&self, session_id: &str, event: &SessionEvent) {
        let mut status = self.status.entry(session_id.to_string()).or_default();
        match event {
            SessionEvent::Connected {
                state,
                permission_mode,
                mode_version,
            } => {
                status.state = *state;
                status.permission_mode = permission_mode.clone();
                status.mode_version = *mode_version;
            }
            SessionEvent::Status { state, .. } => status.state = *state,
            SessionEvent::ModeChange {
                permission_mode,
                mode_version,
            } => {
                // Stale mode changes can arrive out of order
                if *mode_version >= status.mode_version {
                    status.permission_mode = permission_mode.clone();
                    status.mode_version = *mode_version;
                }
            }
            SessionEvent::Complete => status.state = AgentState::Idle,
            SessionEvent::Message(_) | SessionEvent::Heartbeat { .. } | SessionEvent::Error { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged_with_event_type() {
        let event = SessionEvent::ModeChange {
            permission_mode: "plan".to_string(),
            mode_version: 3,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"eventType": "mode-change", "permissionMode": "plan", "modeVersion": 3})
        );
        assert_eq!(
            serde_json::to_value(SessionEvent::Complete).unwrap(),
            json!({"eventType": "complete"})
        );
    }

    #[test]
    fn message_event_flattens_the_message() {
        let msg = NormalizedMessage::new("m1", "assistant", "2026-02-01T10:00:00Z");
        let value = serde_json::to_value(SessionEvent::Message(msg.clone())).unwrap();
        assert_eq!(value["eventType"], "message");
        assert_eq!(value["uuid"], "m1");

        let back: SessionEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, SessionEvent::Message(msg));
    }

    #[tokio::test]
    async fn publish_reaches_session_subscribers_in_order() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe("s1");
        let mut other = hub.subscribe("s2");

        let a = hub.publish("s1", SessionEvent::Status { state: AgentState::Running, request: None });
        let b = hub.publish("s1", SessionEvent::Complete);
        assert!(b > a);

        assert_eq!(rx.recv().await.unwrap().0, a);
        assert_eq!(rx.recv().await.unwrap(), (b, SessionEvent::Complete));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn connected_reflects_latest_status() {
        let hub = EventHub::new(4);
        hub.publish("s1", SessionEvent::Status { state: AgentState::WaitingInput, request: None });
        hub.publish("s1", SessionEvent::ModeChange { permission_mode: "plan".into(), mode_version: 2 });
        hub.publish("s1", SessionEvent::ModeChange { permission_mode: "default".into(), mode_version: 1 });

        assert_eq!(
            hub.connected("s1"),
            SessionEvent::Connected {
                state: AgentState::WaitingInput,
                permission_mode: "plan".to_string(),
                mode_version: 2,
            }
        );
        assert_eq!(
            hub.connected("unknown"),
            SessionEvent::Connected {
                state: AgentState::Idle,
                permission_mode: "default".to_string(),
                mode_version: 0,
            }
        );
    }

    #[test]
    fn prune_drops_unobserved_channels() {
        let hub = EventHub::new(4);
        let rx = hub.subscribe("s1");
        let _keep = hub.subscribe("s2");
        drop(rx);
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
        assert!(hub.channels.contains_key("s2"));
    }
}
