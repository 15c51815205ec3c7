use serde_json::Value;
use tokio::sync::broadcast;

use mctl_types::EngineEvent;

/// In-process fan-out of engine events. Slow subscribers lag and drop; publishers never block.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event_type = %event.event_type, "engine event");
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, event_type: &str, properties: Value) {
        self.publish(EngineEvent::new(event_type, properties));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
