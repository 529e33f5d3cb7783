use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tempo_shared::Masked;
use uuid::Uuid;

use crate::booking::Booking;
use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Queued,
    Completed,
    Failed,
    Cancelled,
    Reversed,
    MaxRetriesReached,
}

impl PayoutStatus {
    pub const IN_FLIGHT: [PayoutStatus; 3] = [PayoutStatus::Pending, PayoutStatus::Processing, PayoutStatus::Queued];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Processing => "PROCESSING",
            PayoutStatus::Queued => "QUEUED",
            PayoutStatus::Completed => "COMPLETED",
            PayoutStatus::Failed => "FAILED",
            PayoutStatus::Cancelled => "CANCELLED",
            PayoutStatus::Reversed => "REVERSED",
            PayoutStatus::MaxRetriesReached => "MAX_RETRIES_REACHED",
        }
    }

    /// Maps a provider status string onto the local enum.
    pub fn from_provider(raw: &str) -> PayoutStatus {
        match raw.to_ascii_uppercase().as_str() {
            "SUCCESS" => PayoutStatus::Completed,
            "FAILED" => PayoutStatus::Failed,
            "CANCELLED" => PayoutStatus::Cancelled,
            "REVERSED" => PayoutStatus::Reversed,
            "PROCESSING" => PayoutStatus::Processing,
            "QUEUED" => PayoutStatus::Queued,
            _ => PayoutStatus::Pending,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PayoutStatus::Pending),
            "PROCESSING" => Ok(PayoutStatus::Processing),
            "QUEUED" => Ok(PayoutStatus::Queued),
            "COMPLETED" => Ok(PayoutStatus::Completed),
            "FAILED" => Ok(PayoutStatus::Failed),
            "CANCELLED" => Ok(PayoutStatus::Cancelled),
            "REVERSED" => Ok(PayoutStatus::Reversed),
            "MAX_RETRIES_REACHED" => Ok(PayoutStatus::MaxRetriesReached),
            other => Err(CoreError::ValidationError(format!("unknown payout status {}", other))),
        }
    }
}

/// Transfer of a completed booking's proceeds to the room owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub room_id: Uuid,
    pub destination: Masked<String>,
    pub beneficiary_name: String,
    pub amount: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Idempotency reference sent to the provider; fixed for the payout's lifetime.
    pub reference_id: String,
    pub provider_transaction_id: Option<String>,
    pub utr: Option<String>,
    pub status_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    pub fn for_booking(
        booking: &Booking,
        destination: Masked<String>,
        beneficiary_name: String,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            room_id: booking.room_id,
            destination,
            beneficiary_name,
            amount: booking.total_amount,
            currency: currency.to_string(),
            status: PayoutStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            reference_id: reference_id(now),
            provider_transaction_id: None,
            utr: None,
            status_details: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_failed(&mut self, details: String, next_retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = PayoutStatus::Failed;
        self.status_details = Some(details);
        self.next_retry_at = Some(next_retry_at);
        self.updated_at = now;
    }
}

/// `TMP` + UTC timestamp + 8 hex chars, e.g. `TMP20250301143000a1b2c3d4`.
pub fn reference_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("TMP{}{}", now.format("%Y%m%d%H%M%S"), &suffix[..8])
}
