use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hold::ExpiryAction;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel backend error: {0}")]
    Backend(String),
    #[error("Failed to encode action: {0}")]
    Encode(String),
}

/// A claimed action. It stays invisible to other consumers until it is
/// acked, retried, or dead-lettered, or its claim lapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub action: ExpiryAction,
    /// Deliveries so far, including this one.
    pub attempts: u32,
}

/// Entry on the recovery path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// `None` when the stored payload could not be decoded.
    pub action: Option<ExpiryAction>,
    pub raw: String,
    pub reason: String,
    pub attempts: u32,
}

/// Durable delayed-action channel with dead-letter semantics.
#[async_trait]
pub trait DelayedActionChannel: Send + Sync {
    async fn publish(&self, action: &ExpiryAction, fire_at: DateTime<Utc>) -> Result<(), ChannelError>;

    /// Claim up to `limit` actions whose fire time is at or before `now`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>, ChannelError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError>;

    /// Put the action back, to fire again at `fire_at`.
    async fn retry(&self, delivery: &Delivery, fire_at: DateTime<Utc>) -> Result<(), ChannelError>;

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), ChannelError>;

    /// Remove and return up to `limit` dead letters.
    async fn drain_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, ChannelError>;
}
