use anyhow::Context;
use chrono_tz::Tz;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempo_api::{app, worker, AppState};
use tempo_booking::{
    BookingCommitWorker, BroadcastHub, FanoutPublisher, PayoutDispatcher, PayoutRetryMonitor,
    ReservationExpiryPipeline, ReservationStore, Scheduler, SessionLifecycleMonitor,
};
use tempo_core::{Clock, SystemClock};
use tempo_store::app_config::Config;
use tempo_store::{
    DbClient, EventProducer, HttpPayoutProvider, PgBookingRepository, PgPayoutRepository,
    PgReconciliationRepository, PgRoomRepository, RedisClient,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempo_api=debug,tempo_booking=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Tempo API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let rules = db
        .fetch_business_rules(config.business_rules.clone())
        .await
        .context("Failed to load business rules")?;
    let timezone: Tz = rules
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid timezone {}: {}", rules.timezone, e))?;

    // Redis delayed-action channel
    let channel = Arc::new(
        RedisClient::new(&config.redis.url, &config.redis.namespace)
            .await
            .context("Failed to connect to Redis")?,
    );

    // Kafka
    let producer = Arc::new(
        EventProducer::new(
            &config.kafka.brokers,
            &config.kafka.events_topic,
            &config.kafka.commit_topic,
        )
        .context("Failed to create Kafka producer")?,
    );

    let provider = Arc::new(
        HttpPayoutProvider::new(config.payout_provider.clone()).context("Failed to build payout client")?,
    );

    let hub = Arc::new(BroadcastHub::new(256));
    let publisher = Arc::new(FanoutPublisher::new().with(hub.clone()).with(producer.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let rooms = Arc::new(PgRoomRepository::new(db.pool.clone()));
    let bookings = Arc::new(PgBookingRepository::new(db.pool.clone()));
    let payouts = Arc::new(PgPayoutRepository::new(db.pool.clone()));
    let reconciliation = Arc::new(PgReconciliationRepository::new(db.pool.clone()));

    let reservations = Arc::new(ReservationStore::new(
        rooms.clone(),
        channel.clone(),
        publisher.clone(),
        clock.clone(),
        &rules,
    ));
    let commit_worker = Arc::new(BookingCommitWorker::new(
        reservations.clone(),
        bookings.clone(),
        reconciliation,
        provider.clone(),
        publisher.clone(),
        clock.clone(),
    ));
    let dispatcher = Arc::new(PayoutDispatcher::new(
        bookings.clone(),
        payouts.clone(),
        rooms,
        provider.clone(),
        publisher.clone(),
        &rules,
    ));

    let lifecycle = Arc::new(SessionLifecycleMonitor::new(
        bookings.clone(),
        dispatcher.clone(),
        publisher.clone(),
        timezone,
    ));
    let payout_monitor = Arc::new(PayoutRetryMonitor::new(payouts.clone(), provider, dispatcher, &rules));
    let expiry = Arc::new(ReservationExpiryPipeline::new(
        channel,
        reservations.clone(),
        rules.max_expiry_deliveries,
    ));

    let schedule = &config.schedule;
    let _tasks = Scheduler::new(clock)
        .every(Duration::from_secs(schedule.expiry_interval_seconds), expiry)
        .every(Duration::from_secs(schedule.lifecycle_interval_seconds), lifecycle)
        .every(Duration::from_secs(schedule.payout_interval_seconds), payout_monitor)
        .spawn();

    tokio::spawn({
        let commits = commit_worker.clone();
        let kafka = config.kafka.clone();
        async move {
            if let Err(e) = worker::start_commit_worker(kafka.brokers, kafka.group_id, kafka.commit_topic, commits).await {
                tracing::error!("Commit worker stopped: {}", e);
            }
        }
    });

    let state = AppState {
        reservations,
        commit_worker,
        bookings,
        payouts,
        hub,
        commit_queue: Some(producer),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}
