use async_trait::async_trait;
use std::sync::Arc;
use tempo_core::events::EventPublisher;
use tempo_shared::DomainEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// In-process fan-out to connected SSE clients.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastHub {
    async fn publish(&self, event: DomainEvent) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            debug!("No live subscribers for broadcast");
        }
    }
}

/// Publishes every event to each sink in turn.
#[derive(Clone, Default)]
pub struct FanoutPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventPublisher for FanoutPublisher {
    async fn publish(&self, event: DomainEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone()).await;
        }
    }
}
