use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus, CommitFailure, CommitRequest, ReconciliationStatus};
use crate::hold::HoldSnapshot;
use crate::payout::{Payout, PayoutStatus};
use crate::room::Room;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Permanent booking of one slot on one date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotBookingMarker {
    pub slot_id: u32,
    pub booked_by: String,
    pub booking_id: Uuid,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed(Booking),
    /// A booking already exists for this payment id.
    Duplicate(Booking),
    /// Nothing was written; these slots failed re-validation.
    Conflict(Vec<u32>),
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError>;

    /// Slots permanently booked on `date`, ignoring terminated bookings.
    async fn booked_slots(&self, room_id: Uuid, date: NaiveDate) -> Result<Vec<SlotBookingMarker>, StoreError>;
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Atomically re-validate the requested slots against `holds` and the
    /// persisted bookings, then insert the booking and mark its slots booked.
    async fn commit_booking(
        &self,
        request: &CommitRequest,
        holds: &HoldSnapshot,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError>;

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;

    /// Bookings that are neither COMPLETED nor TERMINATED.
    async fn list_active(&self) -> Result<Vec<Booking>, StoreError>;

    /// Compare-and-set status change. Returns false if the booking was not in `from`.
    async fn transition_status(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// ONGOING → COMPLETED and insertion of `payout`, in one transaction.
    /// Returns false (and writes nothing) if the booking was not ONGOING.
    async fn complete_with_payout(&self, id: Uuid, payout: &Payout, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait PayoutRepository: Send + Sync {
    async fn get_payout(&self, id: Uuid) -> Result<Option<Payout>, StoreError>;

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<Payout>, StoreError>;

    async fn list_by_room(&self, room_id: Uuid) -> Result<Vec<Payout>, StoreError>;

    async fn list_by_status(&self, statuses: &[PayoutStatus]) -> Result<Vec<Payout>, StoreError>;

    async fn update(&self, payout: &Payout) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    /// Insert or update a ledger entry.
    async fn record(&self, failure: &CommitFailure) -> Result<(), StoreError>;

    async fn find_by_payment_id(&self, payment_id: &str) -> Result<Option<CommitFailure>, StoreError>;

    async fn list_by_status(&self, status: ReconciliationStatus) -> Result<Vec<CommitFailure>, StoreError>;
}
