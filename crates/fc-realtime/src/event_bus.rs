use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Internal events published by the Session Coordinator, Fleet Manager, and
/// Update Pipeline, consumed by the Realtime Hub for fan-out. Kept separate
/// from [`crate::protocol::ServerMessage`] — the wire format a client sees is
/// derived from these, not identical to them.
#[derive(Debug, Clone)]
pub enum InternalEvent {
    SessionOutput { session_id: Uuid, chunk: String },
    SessionStateChange { session_id: Uuid, from: String, to: String },
    ApprovalRequested { session_id: Uuid, approval_id: Uuid, description: String },
    SessionCompleted { session_id: Uuid, state: String },
    TerminalOutput { session_id: Uuid, data: String },
    TerminalInput { client_id: Uuid, session_id: Uuid, data: String },
    RunnerOffline { runner_id: Uuid },
    VersionDiscovered { provider_id: String, version: String },
    Generic { name: String, payload: serde_json::Value },
}

/// A broadcast-style event bus built on top of flume channels. Each call to
/// [`subscribe`] creates a new receiver that will receive all messages
/// published after the subscription was created. Disconnected subscribers
/// are pruned automatically on publish.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<InternalEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn subscribe(&self) -> flume::Receiver<InternalEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    pub fn publish(&self, event: InternalEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
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
    fn publish_fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        bus.publish(InternalEvent::RunnerOffline { runner_id: Uuid::new_v4() });
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe();
        }
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(InternalEvent::RunnerOffline { runner_id: Uuid::new_v4() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
