use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempo_shared::Masked;

/// What the payout provider needs to move money to a room owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutInstruction {
    pub reference_id: String,
    pub amount: i64,
    pub destination: Masked<String>,
    pub beneficiary_name: String,
    pub purpose: String,
}

/// Provider-side view of a payout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderPayout {
    pub transaction_id: String,
    /// Raw provider status, mapped with `PayoutStatus::from_provider`.
    pub status: String,
    pub utr: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub amount: i64,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failures, timeouts, 5xx. Safe to try again later.
    #[error("Provider temporarily unavailable: {0}")]
    Transient(String),
    #[error("Provider rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PayoutProvider: Send + Sync {
    /// Submit a payout. Re-submitting the same `reference_id` must not pay twice.
    async fn initiate_payout(&self, instruction: &PayoutInstruction) -> Result<ProviderPayout, ProviderError>;

    /// Fetch payout status by provider transaction id
    async fn fetch_status(&self, transaction_id: &str) -> Result<ProviderPayout, ProviderError>;

    /// Refund (part of) a captured payment
    async fn refund(&self, payment_id: &str, amount: i64, note: &str) -> Result<RefundReceipt, ProviderError>;
}
