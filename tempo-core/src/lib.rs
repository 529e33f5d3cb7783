pub mod booking;
pub mod channel;
pub mod clock;
pub mod events;
pub mod hold;
pub mod payment;
pub mod payout;
pub mod repository;
pub mod room;

pub use booking::{Booking, BookingStatus, CommitFailure, CommitRequest, ReconciliationStatus, RefundDetails};
pub use clock::{Clock, ManualClock, SystemClock};
pub use hold::{ExpiryAction, Hold, HoldSnapshot};
pub use payout::{Payout, PayoutStatus};
pub use room::{BookedSlot, Room, Slot, SlotTemplate};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Internal service error: {0}")]
    InternalError(String),
}
