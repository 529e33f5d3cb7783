use std::sync::Arc;
use tempo_booking::{BookingCommitWorker, BroadcastHub, ReservationStore};
use tempo_core::repository::{BookingRepository, PayoutRepository};
use tempo_store::EventProducer;

#[derive(Clone)]
pub struct AppState {
    pub reservations: Arc<ReservationStore>,
    pub commit_worker: Arc<BookingCommitWorker>,
    pub bookings: Arc<dyn BookingRepository>,
    pub payouts: Arc<dyn PayoutRepository>,
    pub hub: Arc<BroadcastHub>,
    /// Kafka producer for queued commit requests; absent when running without Kafka.
    pub commit_queue: Option<Arc<EventProducer>>,
}
