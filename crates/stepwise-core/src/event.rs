use crate::traits::EventObserver;
use crate::types::ProcessEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all public process events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ProcessEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ProcessEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProcessEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventObserver for EventBus {
    fn on_event(&self, event: &ProcessEvent) {
        self.publish(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = ProcessEvent::new("A", "a-1", "run.OnResult", None).public();
        bus.on_event(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(ProcessEvent::new("A", "a-1", "x", None));
    }
}
