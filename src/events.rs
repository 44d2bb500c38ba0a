//! In-process event bus.
//!
//! Observers (channel re-render, metrics) subscribe explicitly instead of
//! relying on app-wide signal dispatch. Publishing never fails: with no
//! subscribers the event is simply dropped.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::LogRecordType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    GroupCreated {
        alert_group_id: Uuid,
    },
    GroupStateChanged {
        alert_group_id: Uuid,
        record_type: LogRecordType,
    },
    LogRecordAdded {
        alert_group_id: Uuid,
        record_type: LogRecordType,
    },
    /// Downstream aggregates (metrics, channel views) should refresh this group
    GroupRefresh {
        alert_group_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // Err only means there are no subscribers right now
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
