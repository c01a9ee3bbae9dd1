use tokio::sync::broadcast;

use relay_types::ControllerEvent;

/// Backbone of the real-time fan-out (spec.md §4.6). Each `/ws/client`
/// connection subscribes and layers its own bounded, coalescing queue on
/// top (see `relay-server`'s connection handler) — this struct only
/// provides the shared broadcast primitive.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ControllerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
