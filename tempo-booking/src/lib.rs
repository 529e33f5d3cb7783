pub mod broadcast;
pub mod commit;
pub mod expiry;
pub mod holds;
pub mod lifecycle;
pub mod payout;
pub mod reservation;
pub mod scheduler;

pub use broadcast::{BroadcastHub, FanoutPublisher};
pub use commit::{BookingCommitWorker, CommitError};
pub use expiry::{ExpiryHandler, ReservationExpiryPipeline};
pub use lifecycle::SessionLifecycleMonitor;
pub use payout::{PayoutDispatcher, PayoutRetryMonitor};
pub use reservation::{HoldError, HoldGrant, ReservationStore};
pub use scheduler::{ScheduledTask, Scheduler};
