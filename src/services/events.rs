// Event Plumbing
// Named JSON events published to whoever hosts the orchestrator

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

pub fn emit_event<T: Serialize>(sink: &dyn EventSink, event: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => sink.emit(event, value),
        Err(e) => log::warn!("Failed to serialize payload for {event}: {e}"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerEvent {
    pub event: String,
    pub payload: Value,
}

/// Broadcast-backed sink; every subscriber sees every event emitted after it subscribed
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &str, payload: Value) {
        let _ = self.sender.send(ServerEvent {
            event: event.to_string(),
            payload,
        });
    }
}
