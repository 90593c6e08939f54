use crate::types::EngineEvent;

/// Event bus using tokio broadcast channel.
/// Publish-only from the engine's side; all subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunId;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::RunStarted {
            run_id: RunId::new(),
            workflow_id: "wf-1".into(),
        });
    }

    #[tokio::test]
    async fn test_all_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();
        let run_id = RunId::from_str("r-1");
        bus.publish(EngineEvent::RunSuccess {
            run_id: run_id.clone(),
            workflow_id: "wf-1".into(),
        });
        assert_eq!(rx_a.recv().await.unwrap().run_id(), &run_id);
        assert_eq!(rx_b.recv().await.unwrap().run_id(), &run_id);
    }
}
