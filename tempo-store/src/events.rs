use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tempo_core::events::EventPublisher;
use tempo_core::CommitRequest;
use tempo_shared::DomainEvent;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    events_topic: String,
    commit_topic: String,
}

impl EventProducer {
    pub fn new(brokers: &str, events_topic: &str, commit_topic: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            events_topic: events_topic.to_string(),
            commit_topic: commit_topic.to_string(),
        })
    }

    pub async fn publish_raw(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    "Sent message to {}/{}: partition {} offset {}",
                    topic, key, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// Queue a captured payment for the commit worker. Keyed by room so
    /// commits for one room stay ordered on a partition.
    pub async fn submit_commit(&self, request: &CommitRequest) -> Result<(), ProduceError> {
        let payload = serde_json::to_string(request)?;
        self.publish_raw(&self.commit_topic, &request.room_id.to_string(), &payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for EventProducer {
    async fn publish(&self, event: DomainEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialise {} event: {}", event.kind(), e);
                return;
            }
        };

        // Delivery failures are already logged
        let _ = self
            .publish_raw(&self.events_topic, &event.room_id().to_string(), &payload)
            .await;
    }
}
