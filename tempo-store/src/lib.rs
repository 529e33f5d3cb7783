pub mod app_config;
pub mod booking_repo;
pub mod database;
pub mod events;
pub mod memory;
pub mod payout_client;
pub mod payout_repo;
pub mod redis_repo;
pub mod room_repo;

pub use booking_repo::PgBookingRepository;
pub use database::DbClient;
pub use events::EventProducer;
pub use memory::{InMemoryChannel, InMemoryStore, MockPayoutProvider, RecordingPublisher};
pub use payout_client::HttpPayoutProvider;
pub use payout_repo::{PgPayoutRepository, PgReconciliationRepository};
pub use redis_repo::RedisClient;
pub use room_repo::PgRoomRepository;

use tempo_core::repository::StoreError;

pub(crate) fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
