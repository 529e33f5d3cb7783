use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use tempo_booking::expiry::ExpiryReport;
use tempo_booking::{
    BookingCommitWorker, CommitError, HoldError, PayoutDispatcher, PayoutRetryMonitor, ReservationExpiryPipeline,
    ReservationStore, SessionLifecycleMonitor,
};
use tempo_core::channel::DeadLetter;
use tempo_core::payment::ProviderError;
use tempo_core::repository::{BookingRepository, PayoutRepository, ReconciliationRepository, StoreError};
use tempo_core::{
    BookedSlot, BookingStatus, Clock, CommitFailure, CommitRequest, ExpiryAction, ManualClock, PayoutStatus, ReconciliationStatus,
    Room, SlotTemplate,
};
use tempo_shared::Masked;
use tempo_store::app_config::BusinessRules;
use tempo_store::{InMemoryChannel, InMemoryStore, MockPayoutProvider, RecordingPublisher};
use uuid::Uuid;

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
}

/// Wall-clock time on the booking date in the rooms' zone.
fn ist(h: u32, m: u32) -> DateTime<Utc> {
    chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2025, 3, 1, h, m, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn room(destination: Option<&str>) -> Room {
    Room {
        id: Uuid::new_v4(),
        name: "Studio 4".to_string(),
        owner_name: "Asha Rao".to_string(),
        payout_destination: destination.map(|d| Masked(d.to_string())),
        slots: vec![
            SlotTemplate { slot_id: 1, start_time: hm(9, 0), end_time: hm(10, 0) },
            SlotTemplate { slot_id: 2, start_time: hm(14, 0), end_time: hm(15, 0) },
            SlotTemplate { slot_id: 3, start_time: hm(15, 0), end_time: hm(16, 0) },
        ],
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: InMemoryStore,
    channel: InMemoryChannel,
    events: RecordingPublisher,
    provider: MockPayoutProvider,
    reservations: Arc<ReservationStore>,
    commit: BookingCommitWorker,
    lifecycle: SessionLifecycleMonitor,
    payouts: PayoutRetryMonitor,
    expiry: ReservationExpiryPipeline,
    room: Room,
}

impl Harness {
    async fn new() -> Self {
        Self::with_room(room(Some("owner.studio@okbank"))).await
    }

    async fn with_room(room: Room) -> Self {
        let rules = BusinessRules::default();
        let clock = Arc::new(ManualClock::new(ist(8, 0)));
        let store = InMemoryStore::new();
        let channel = InMemoryChannel::new();
        let events = RecordingPublisher::new();
        let provider = MockPayoutProvider::new();
        store.insert_room(room.clone()).await;

        let reservations = Arc::new(ReservationStore::new(
            Arc::new(store.clone()),
            Arc::new(channel.clone()),
            Arc::new(events.clone()),
            clock.clone(),
            &rules,
        ));
        let commit = BookingCommitWorker::new(
            reservations.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
            Arc::new(events.clone()),
            clock.clone(),
        );
        let dispatcher = Arc::new(PayoutDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
            Arc::new(events.clone()),
            &rules,
        ));
        let lifecycle = SessionLifecycleMonitor::new(
            Arc::new(store.clone()),
            dispatcher.clone(),
            Arc::new(events.clone()),
            chrono_tz::Asia::Kolkata,
        );
        let payouts = PayoutRetryMonitor::new(Arc::new(store.clone()), Arc::new(provider.clone()), dispatcher, &rules);
        let expiry = ReservationExpiryPipeline::new(
            Arc::new(channel.clone()),
            reservations.clone(),
            rules.max_expiry_deliveries,
        );

        Self {
            clock,
            store,
            channel,
            events,
            provider,
            reservations,
            commit,
            lifecycle,
            payouts,
            expiry,
            room,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn request(&self, user: &str, slot_ids: &[u32], payment_id: &str) -> CommitRequest {
        CommitRequest {
            user_id: user.to_string(),
            room_id: self.room.id,
            date: day(),
            slots: slot_ids
                .iter()
                .filter_map(|id| self.room.slot(*id))
                .map(BookedSlot::from)
                .collect(),
            amount: 150_000,
            payment_id: payment_id.to_string(),
        }
    }

    /// Hold then commit the afternoon slots for `user`.
    async fn book_afternoon(&self, user: &str) -> Uuid {
        self.reservations
            .acquire_hold(self.room.id, day(), &[2, 3], user)
            .await
            .unwrap();
        self.commit
            .commit(&self.request(user, &[2, 3], &format!("pay_{}", user)))
            .await
            .unwrap()
            .id
    }

    async fn status(&self, booking_id: Uuid) -> BookingStatus {
        self.store.get_booking(booking_id).await.unwrap().unwrap().status
    }
}

#[tokio::test]
async fn test_scenario_a_conflict_until_ttl_elapses() {
    let h = Harness::new().await;

    let grant = h.reservations.acquire_hold(h.room.id, day(), &[1], "user-a").await.unwrap();
    assert_eq!(grant.expires_at, h.now() + Duration::minutes(5));

    h.clock.advance(Duration::minutes(4));
    let err = h.reservations.acquire_hold(h.room.id, day(), &[1], "user-b").await.unwrap_err();
    assert!(matches!(err, HoldError::Conflict(ref slots) if slots == &vec![1]));

    h.clock.advance(Duration::minutes(1));
    let grant = h.reservations.acquire_hold(h.room.id, day(), &[1], "user-b").await.unwrap();
    assert_eq!(grant.holder_id, "user-b");

    // A's compensating action fires now and must leave B's hold alone
    let report = h.expiry.tick(h.now()).await;
    assert_eq!(report.handled, 1);
    assert_eq!(report.released, 0);

    let slots = h.reservations.query_holds(h.room.id, day()).await.unwrap();
    let slot = slots.iter().find(|s| s.slot_id == 1).unwrap();
    assert_eq!(slot.reserved_by.as_deref(), Some("user-b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquires_admit_one_holder() {
    let h = Harness::new().await;

    let attempts = (0..16).map(|i| {
        let reservations = h.reservations.clone();
        let room_id = h.room.id;
        tokio::spawn(async move {
            reservations
                .acquire_hold(room_id, day(), &[2, 3], &format!("user-{}", i))
                .await
        })
    });

    let mut granted = 0;
    let mut conflicts = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        match attempt.await.unwrap() {
            Ok(_) => granted += 1,
            Err(HoldError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test]
async fn test_batches_are_all_or_nothing() {
    let h = Harness::new().await;
    h.reservations.acquire_hold(h.room.id, day(), &[2], "user-a").await.unwrap();

    let err = h.reservations.acquire_hold(h.room.id, day(), &[1, 2, 3], "user-b").await.unwrap_err();
    assert!(matches!(err, HoldError::Conflict(ref slots) if slots == &vec![2]));

    let snapshot = h.reservations.snapshot(h.room.id, day());
    assert!(!snapshot.contains_key(&1));
    assert!(!snapshot.contains_key(&3));
}

#[tokio::test]
async fn test_commit_converts_holds_and_blocks_slots() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;

    assert_eq!(h.status(booking_id).await, BookingStatus::NotStarted);
    assert!(h.reservations.snapshot(h.room.id, day()).is_empty());

    let slots = h.reservations.query_holds(h.room.id, day()).await.unwrap();
    let booked: Vec<u32> = slots.iter().filter(|s| s.is_booked).map(|s| s.slot_id).collect();
    assert_eq!(booked, vec![2, 3]);
    assert!(slots.iter().all(|s| !(s.is_booked && s.reserved_by.is_some())));

    let err = h.reservations.acquire_hold(h.room.id, day(), &[3], "user-b").await.unwrap_err();
    assert!(matches!(err, HoldError::Conflict(_)));
}

#[tokio::test]
async fn test_duplicate_payment_returns_existing_booking() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;

    let again = h.commit.commit(&h.request("user-a", &[2, 3], "pay_user-a")).await.unwrap();
    assert_eq!(again.id, booking_id);
    assert_eq!(h.store.all_bookings().await.len(), 1);
    assert!(h.provider.refunds().is_empty());
}

#[tokio::test]
async fn test_stale_hold_commit_is_refunded_once() {
    let h = Harness::new().await;
    h.reservations.acquire_hold(h.room.id, day(), &[1], "user-a").await.unwrap();

    h.clock.advance(Duration::minutes(5));
    let request = h.request("user-a", &[1], "pay_late");
    let err = h.commit.commit(&request).await.unwrap_err();
    assert!(matches!(err, CommitError::Conflict { ref slots, refunded: true } if slots == &vec![1]));

    assert!(h.store.all_bookings().await.is_empty());
    assert_eq!(h.provider.refunds(), vec![("pay_late".to_string(), 150_000)]);
    let ledger = ReconciliationRepository::list_by_status(&h.store, ReconciliationStatus::Refunded).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].refund_id.as_deref(), Some("rfnd_pay_late"));
    assert!(h.events.kinds().contains(&"commit_failed"));

    // Redelivery of the same request
    let err = h.commit.commit(&request).await.unwrap_err();
    assert!(matches!(err, CommitError::Conflict { refunded: true, .. }));
    assert_eq!(h.provider.refunds().len(), 1);
}

#[tokio::test]
async fn test_commit_conflict_without_refund_goes_to_manual_review() {
    let h = Harness::new().await;
    h.reservations.acquire_hold(h.room.id, day(), &[2], "user-b").await.unwrap();
    h.provider.fail_refunds(Some(ProviderError::Transient("gateway down".to_string())));

    let err = h.commit.commit(&h.request("user-a", &[2], "pay_x")).await.unwrap_err();
    assert!(matches!(err, CommitError::Conflict { refunded: false, .. }));

    let ledger = ReconciliationRepository::list_by_status(&h.store, ReconciliationStatus::ManualReview).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].conflicting_slots, vec![2]);
    // Other holders keep their holds
    assert_eq!(h.reservations.snapshot(h.room.id, day())[&2].holder_id, "user-b");
}

#[tokio::test]
async fn test_commit_with_shifted_slot_times_is_rejected() {
    let h = Harness::new().await;
    h.reservations.acquire_hold(h.room.id, day(), &[2], "user-a").await.unwrap();

    let mut request = h.request("user-a", &[2], "pay_shifted");
    request.slots[0].start_time = hm(7, 0);
    request.slots[0].end_time = hm(7, 1);
    let err = h.commit.commit(&request).await.unwrap_err();
    assert!(matches!(err, CommitError::Conflict { ref slots, .. } if slots == &vec![2]));
    assert!(h.store.all_bookings().await.is_empty());

    let report = h.lifecycle.tick(h.now()).await.unwrap();
    assert_eq!(report.completed, 0);
    assert!(h.provider.submissions().is_empty());
}

/// Ledger whose writes always fail.
struct UnwritableLedger;

#[async_trait]
impl ReconciliationRepository for UnwritableLedger {
    async fn record(&self, _failure: &CommitFailure) -> Result<(), StoreError> {
        Err(StoreError::Database("ledger unavailable".to_string()))
    }

    async fn find_by_payment_id(&self, _payment_id: &str) -> Result<Option<CommitFailure>, StoreError> {
        Ok(None)
    }

    async fn list_by_status(&self, _status: ReconciliationStatus) -> Result<Vec<CommitFailure>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_no_refund_without_ledger_entry() {
    let h = Harness::new().await;
    let commit = BookingCommitWorker::new(
        h.reservations.clone(),
        Arc::new(h.store.clone()),
        Arc::new(UnwritableLedger),
        Arc::new(h.provider.clone()),
        Arc::new(h.events.clone()),
        h.clock.clone(),
    );

    let request = h.request("user-a", &[1], "pay_unrecorded");
    for _ in 0..2 {
        let err = commit.commit(&request).await.unwrap_err();
        assert!(matches!(err, CommitError::Store(_)));
    }
    assert!(h.provider.refunds().is_empty());
}

#[tokio::test]
async fn test_scenario_b_session_lifecycle() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;

    let report = h.lifecycle.tick(ist(13, 59)).await.unwrap();
    assert_eq!(report.started, 0);
    assert_eq!(h.status(booking_id).await, BookingStatus::NotStarted);

    let report = h.lifecycle.tick(ist(14, 30)).await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(h.status(booking_id).await, BookingStatus::Ongoing);

    h.lifecycle.tick(ist(15, 59)).await.unwrap();
    assert_eq!(h.status(booking_id).await, BookingStatus::Ongoing);

    let report = h.lifecycle.tick(ist(16, 1)).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.status(booking_id).await, BookingStatus::Completed);

    let payouts = h.store.all_payouts().await;
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, 150_000);
    assert_eq!(payouts[0].status, PayoutStatus::Processing);
    assert_eq!(h.provider.submissions().len(), 1);
    assert_eq!(h.provider.submissions()[0].destination.expose(), "owner.studio@okbank");
}

#[tokio::test]
async fn test_missed_ticks_catch_up_in_one_poll() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;

    let report = h.lifecycle.tick(ist(18, 0)).await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(h.status(booking_id).await, BookingStatus::Completed);
}

#[tokio::test]
async fn test_repeated_polls_never_pay_twice() {
    let h = Harness::new().await;
    h.book_afternoon("user-a").await;
    h.lifecycle.tick(ist(14, 30)).await.unwrap();

    let (a, b) = tokio::join!(h.lifecycle.tick(ist(16, 1)), h.lifecycle.tick(ist(16, 1)));
    assert_eq!(a.unwrap().completed + b.unwrap().completed, 1);

    for minutes in 2..6 {
        h.lifecycle.tick(ist(16, minutes)).await.unwrap();
    }
    assert_eq!(h.store.all_payouts().await.len(), 1);
    assert_eq!(h.provider.submissions().len(), 1);
}

#[tokio::test]
async fn test_terminated_booking_is_never_advanced() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;
    h.lifecycle.tick(ist(14, 30)).await.unwrap();

    let now = ist(14, 45);
    assert!(h
        .store
        .transition_status(booking_id, BookingStatus::Ongoing, BookingStatus::Terminated, now)
        .await
        .unwrap());

    h.lifecycle.tick(ist(16, 30)).await.unwrap();
    assert_eq!(h.status(booking_id).await, BookingStatus::Terminated);
    assert!(h.store.all_payouts().await.is_empty());

    // Terminated slots can be offered again
    h.clock.set(ist(14, 50));
    assert!(h.reservations.acquire_hold(h.room.id, day(), &[3], "user-b").await.is_ok());
}

#[tokio::test]
async fn test_completed_booking_cannot_be_terminated() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;
    h.lifecycle.tick(ist(17, 0)).await.unwrap();

    let moved = h
        .store
        .transition_status(booking_id, BookingStatus::Completed, BookingStatus::Terminated, ist(17, 1))
        .await
        .unwrap();
    assert!(!moved);
    assert_eq!(h.status(booking_id).await, BookingStatus::Completed);
}

#[tokio::test]
async fn test_scenario_c_transient_failures_then_success() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;
    h.provider.script_initiate(Err(ProviderError::Transient("timeout".to_string())));
    h.provider.script_initiate(Err(ProviderError::Transient("502 from gateway".to_string())));

    let t0 = ist(16, 1);
    h.lifecycle.tick(t0).await.unwrap();
    let payout = h.store.find_by_booking(booking_id).await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Failed);
    assert_eq!(payout.retry_count, 0);

    let report = h.payouts.tick(t0).await;
    assert_eq!(report.retried, 1);
    let payout = h.store.get_payout(payout.id).await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Failed);
    assert_eq!(payout.retry_count, 1);
    assert_eq!(payout.next_retry_at, Some(t0 + Duration::seconds(300)));

    // Not due yet
    assert_eq!(h.payouts.tick(t0 + Duration::seconds(60)).await.retried, 0);

    let t1 = t0 + Duration::seconds(300);
    h.payouts.tick(t1).await;
    let payout = h.store.get_payout(payout.id).await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Processing);
    assert_eq!(payout.retry_count, 2);

    let transaction_id = payout.provider_transaction_id.clone().unwrap();
    h.provider.set_status(&transaction_id, "SUCCESS");
    h.payouts.tick(t1 + Duration::seconds(300)).await;

    let payout = h.store.get_payout(payout.id).await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Completed);
    assert_eq!(payout.retry_count, 2);
    assert!(payout.utr.is_some());

    // Every attempt reused the same reference
    let submissions = h.provider.submissions();
    assert_eq!(submissions.len(), 3);
    assert!(submissions.iter().all(|s| s.reference_id == payout.reference_id));
}

#[tokio::test]
async fn test_retries_stop_at_the_limit() {
    let h = Harness::new().await;
    h.book_afternoon("user-a").await;
    for _ in 0..10 {
        h.provider.script_initiate(Err(ProviderError::Rejected("invalid vpa".to_string())));
    }

    let mut now = ist(16, 1);
    h.lifecycle.tick(now).await.unwrap();
    for _ in 0..8 {
        h.payouts.tick(now).await;
        now += Duration::hours(2);
    }

    let payouts = h.store.all_payouts().await;
    assert_eq!(payouts[0].status, PayoutStatus::MaxRetriesReached);
    assert_eq!(payouts[0].retry_count, 3);
    assert_eq!(h.provider.submissions().len(), 4);
}

#[tokio::test]
async fn test_provider_failure_seen_in_sync_is_retried() {
    let h = Harness::new().await;
    let booking_id = h.book_afternoon("user-a").await;
    let now = ist(16, 1);
    h.lifecycle.tick(now).await.unwrap();

    let payout = h.store.find_by_booking(booking_id).await.unwrap().unwrap();
    let transaction_id = MockPayoutProvider::transaction_id_for(&payout.reference_id);
    h.provider.set_status(&transaction_id, "FAILED");

    let report = h.payouts.tick(now + Duration::minutes(5)).await;
    assert_eq!(report.synced, 1);
    assert_eq!(report.retried, 1);

    let payout = h.store.get_payout(payout.id).await.unwrap().unwrap();
    assert_eq!(payout.retry_count, 1);
    assert_eq!(payout.status, PayoutStatus::Processing);
}

#[tokio::test]
async fn test_missing_destination_is_filled_on_retry() {
    let mut bare = room(None);
    bare.id = Uuid::new_v4();
    let h = Harness::with_room(bare.clone()).await;
    let booking_id = h.book_afternoon("user-a").await;

    let now = ist(16, 1);
    h.lifecycle.tick(now).await.unwrap();
    let payout = h.store.find_by_booking(booking_id).await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Failed);
    assert!(payout.status_details.unwrap().contains("payout destination"));
    assert!(h.provider.submissions().is_empty());

    h.store
        .insert_room(Room {
            payout_destination: Some(Masked("asha@okbank".to_string())),
            ..bare
        })
        .await;
    h.payouts.tick(now).await;

    let submissions = h.provider.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].destination.expose(), "asha@okbank");
}

#[tokio::test]
async fn test_expiry_releases_only_lapsed_holds() {
    let h = Harness::new().await;
    h.reservations.acquire_hold(h.room.id, day(), &[1], "user-a").await.unwrap();
    h.reservations
        .extend_hold(h.room.id, day(), &[1], 10, "user-a")
        .await
        .unwrap();
    assert_eq!(h.channel.pending(), 2);

    h.clock.advance(Duration::minutes(5));
    let report = h.expiry.tick(h.now()).await;
    assert_eq!(report.handled, 1);
    assert_eq!(report.released, 0);
    assert!(h.reservations.snapshot(h.room.id, day()).contains_key(&1));

    h.clock.advance(Duration::minutes(10));
    let report = h.expiry.tick(h.now()).await;
    assert_eq!(report.released, 1);
    assert!(h.reservations.snapshot(h.room.id, day()).is_empty());
    assert_eq!(h.channel.pending(), 0);
}

#[tokio::test]
async fn test_extend_requires_ownership() {
    let h = Harness::new().await;
    h.reservations.acquire_hold(h.room.id, day(), &[1], "user-a").await.unwrap();

    let err = h
        .reservations
        .extend_hold(h.room.id, day(), &[1], 5, "user-b")
        .await
        .unwrap_err();
    assert!(matches!(err, HoldError::NotOwner { .. }));

    let err = h
        .reservations
        .extend_hold(h.room.id, day(), &[1], 60, "user-a")
        .await
        .unwrap_err();
    assert!(matches!(err, HoldError::Invalid(_)));
}

#[tokio::test]
async fn test_recovery_path_releases_dead_lettered_holds() {
    let h = Harness::new().await;
    let grant = h.reservations.acquire_hold(h.room.id, day(), &[2], "user-a").await.unwrap();

    let action = ExpiryAction::new(grant.batch_id, h.room.id, day(), vec![2], "user-a".to_string(), grant.expires_at);
    h.channel.push_dead_letter(DeadLetter {
        raw: serde_json::to_string(&action).unwrap(),
        action: Some(action),
        reason: "delivery attempts exhausted".to_string(),
        attempts: 6,
    });

    h.clock.advance(Duration::minutes(6));
    let report = h.expiry.tick(h.now()).await;
    assert_eq!(
        report,
        ExpiryReport {
            handled: 1,
            released: 1,
            recovered: 1,
            ..ExpiryReport::default()
        }
    );
    assert!(h.reservations.snapshot(h.room.id, day()).is_empty());
    assert_eq!(h.channel.dead_letter_count(), 0);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let h = Harness::new().await;
    h.reservations.acquire_hold(h.room.id, day(), &[1, 2], "user-a").await.unwrap();

    assert_eq!(h.reservations.release_hold(h.room.id, day(), &[1, 2]).await.unwrap(), vec![1, 2]);
    assert!(h.reservations.release_hold(h.room.id, day(), &[1, 2]).await.unwrap().is_empty());
    assert!(h.reservations.acquire_hold(h.room.id, day(), &[1], "user-b").await.is_ok());
}
