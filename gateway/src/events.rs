//! Status fan-out channel.
//!
//! Orchestrator and pipeline decisions are broadcast to observers (the web UI
//! over WebSocket). Delivery is best-effort: a slow subscriber lags and drops
//! the oldest events rather than stalling publishers.

use lols_common::StatusEvent;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Nobody listening is not an error.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lols_common::PromptSource;

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(StatusEvent::Log {
            message: "nobody home".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_sees_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(StatusEvent::CategoryStatus {
            category: "code".to_string(),
            model_id: "coder".to_string(),
        });
        bus.publish(StatusEvent::SystemPromptUsed {
            prompt: Some("You are a coder.".to_string()),
            source: PromptSource::CategoryLevel,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            StatusEvent::CategoryStatus { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            StatusEvent::SystemPromptUsed { .. }
        ));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(StatusEvent::Log {
            message: "before".to_string(),
        });

        let mut rx = bus.subscribe();
        bus.publish(StatusEvent::Log {
            message: "after".to_string(),
        });

        match rx.recv().await.unwrap() {
            StatusEvent::Log { message } => assert_eq!(message, "after"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
