use async_trait::async_trait;
use tempo_shared::DomainEvent;

/// Push channel towards connected clients and downstream consumers.
///
/// Publishing never fails the caller; implementations log delivery problems.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}
