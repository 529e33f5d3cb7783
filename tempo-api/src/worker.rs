use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use tempo_booking::{BookingCommitWorker, CommitError};
use tempo_core::CommitRequest;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// Consumes queued commit requests. Offsets are committed only after a
/// request has been handled, so a crash redelivers it; the worker dedupes
/// by payment id.
pub async fn start_commit_worker(
    brokers: String,
    group_id: String,
    topic: String,
    worker: Arc<BookingCommitWorker>,
) -> anyhow::Result<()> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .set("group.id", &group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;

    consumer.subscribe(&[topic.as_str()])?;
    info!("Commit worker started, listening to {}", topic);

    loop {
        match consumer.recv().await {
            Err(e) => error!("Kafka error: {}", e),
            Ok(m) => {
                handle_message(&worker, &m).await;
                if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                    warn!("Failed to commit offset {}: {}", m.offset(), e);
                }
            }
        }
    }
}

async fn handle_message(worker: &BookingCommitWorker, m: &BorrowedMessage<'_>) {
    let request: CommitRequest = match m.payload_view::<str>() {
        Some(Ok(payload)) => match serde_json::from_str(payload) {
            Ok(r) => r,
            Err(e) => {
                error!("Skipping malformed commit request at offset {}: {}", m.offset(), e);
                return;
            }
        },
        Some(Err(e)) => {
            error!("Skipping non-utf8 commit request at offset {}: {}", m.offset(), e);
            return;
        }
        None => return,
    };

    let mut attempt: u64 = 0;
    loop {
        match worker.commit(&request).await {
            Ok(booking) => {
                info!(booking_id = %booking.id, "Commit for payment {} handled", request.payment_id);
                return;
            }
            Err(CommitError::Store(e)) => {
                // Payment is captured; keep the partition here until storage recovers
                attempt += 1;
                let wait = (attempt * 2).min(MAX_BACKOFF_SECS);
                error!(
                    "Commit for payment {} failed on storage (attempt {}), retrying in {}s: {}",
                    request.payment_id, attempt, wait, e
                );
                sleep(Duration::from_secs(wait)).await;
            }
            Err(e) => {
                warn!("Commit for payment {} not booked: {}", request.payment_id, e);
                return;
            }
        }
    }
}
