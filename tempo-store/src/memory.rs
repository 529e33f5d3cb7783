//! In-process adapters for every port. Used by the test suites and for
//! running the services without Postgres, Redis or a payout gateway.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempo_core::booking::validate_commit;
use tempo_core::channel::{ChannelError, DeadLetter, DelayedActionChannel, Delivery};
use tempo_core::events::EventPublisher;
use tempo_core::payment::{PayoutInstruction, PayoutProvider, ProviderError, ProviderPayout, RefundReceipt};
use tempo_core::repository::{
    BookingRepository, CommitOutcome, PayoutRepository, ReconciliationRepository, RoomRepository,
    SlotBookingMarker, StoreError,
};
use tempo_core::{
    Booking, BookingStatus, CommitFailure, CommitRequest, ExpiryAction, HoldSnapshot, Payout, PayoutStatus,
    ReconciliationStatus, Room, Slot,
};
use tempo_shared::DomainEvent;
use tokio::sync::RwLock;
use uuid::Uuid;

type SlotKey = (Uuid, NaiveDate, u32);

#[derive(Default)]
struct StoreState {
    rooms: HashMap<Uuid, Room>,
    bookings: HashMap<Uuid, Booking>,
    markers: HashMap<SlotKey, SlotBookingMarker>,
    payouts: HashMap<Uuid, Payout>,
    failures: HashMap<Uuid, CommitFailure>,
}

impl StoreState {
    /// Marker of a live (non-terminated) booking.
    fn live_marker(&self, key: &SlotKey) -> Option<&SlotBookingMarker> {
        self.markers.get(key).filter(|m| {
            self.bookings
                .get(&m.booking_id)
                .is_some_and(|b| b.status != BookingStatus::Terminated)
        })
    }
}

/// Rooms, bookings, payouts and the reconciliation ledger behind one lock.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_room(&self, room: Room) {
        self.state.write().await.rooms.insert(room.id, room);
    }

    /// Seed a booking as if it had been committed.
    pub async fn insert_booking(&self, booking: Booking) {
        let mut state = self.state.write().await;
        for slot in &booking.slots {
            state.markers.insert(
                (booking.room_id, booking.date, slot.slot_id),
                SlotBookingMarker {
                    slot_id: slot.slot_id,
                    booked_by: booking.user_id.clone(),
                    booking_id: booking.id,
                },
            );
        }
        state.bookings.insert(booking.id, booking);
    }

    /// Make every call fail with a database error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn all_payouts(&self) -> Vec<Payout> {
        self.state.read().await.payouts.values().cloned().collect()
    }

    pub async fn all_bookings(&self) -> Vec<Booking> {
        self.state.read().await.bookings.values().cloned().collect()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Database("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomRepository for InMemoryStore {
    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.rooms.get(&room_id).cloned())
    }

    async fn booked_slots(&self, room_id: Uuid, date: NaiveDate) -> Result<Vec<SlotBookingMarker>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut markers: Vec<SlotBookingMarker> = state
            .markers
            .keys()
            .filter(|(r, d, _)| *r == room_id && *d == date)
            .filter_map(|key| state.live_marker(key).cloned())
            .collect();
        markers.sort_by_key(|m| m.slot_id);
        Ok(markers)
    }
}

#[async_trait]
impl BookingRepository for InMemoryStore {
    async fn commit_booking(
        &self,
        request: &CommitRequest,
        holds: &HoldSnapshot,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;

        if let Some(existing) = state.bookings.values().find(|b| b.payment_id == request.payment_id) {
            return Ok(CommitOutcome::Duplicate(existing.clone()));
        }

        let Some(room) = state.rooms.get(&request.room_id) else {
            return Ok(CommitOutcome::Conflict(request.slot_ids()));
        };

        let slots: Vec<Slot> = room
            .slots
            .iter()
            .map(|t| {
                let booked_by = state
                    .live_marker(&(request.room_id, request.date, t.slot_id))
                    .map(|m| m.booked_by.clone());
                Slot::from_template(t, booked_by).with_hold(holds.get(&t.slot_id))
            })
            .collect();

        if let Err(conflicts) = validate_commit(&slots, request, now) {
            return Ok(CommitOutcome::Conflict(conflicts));
        }

        let booking = Booking::from_commit(request, now);
        for slot in &booking.slots {
            state.markers.insert(
                (booking.room_id, booking.date, slot.slot_id),
                SlotBookingMarker {
                    slot_id: slot.slot_id,
                    booked_by: booking.user_id.clone(),
                    booking_id: booking.id,
                },
            );
        }
        state.bookings.insert(booking.id, booking.clone());
        Ok(CommitOutcome::Committed(booking))
    }

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.bookings.get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Booking>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut active: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| !b.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|b| (b.date, b.created_at));
        Ok(active)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        match state.bookings.get_mut(&id) {
            Some(b) if b.status == from => Ok(b.transition(to, now).is_ok()),
            _ => Ok(false),
        }
    }

    async fn complete_with_payout(&self, id: Uuid, payout: &Payout, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;

        if state.payouts.values().any(|p| p.booking_id == id) {
            return Ok(false);
        }
        match state.bookings.get_mut(&id) {
            Some(b) if b.status == BookingStatus::Ongoing => {
                b.transition(BookingStatus::Completed, now)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            }
            _ => return Ok(false),
        }
        state.payouts.insert(payout.id, payout.clone());
        Ok(true)
    }
}

#[async_trait]
impl PayoutRepository for InMemoryStore {
    async fn get_payout(&self, id: Uuid) -> Result<Option<Payout>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.payouts.get(&id).cloned())
    }

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<Payout>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state.payouts.values().find(|p| p.booking_id == booking_id).cloned())
    }

    async fn list_by_room(&self, room_id: Uuid) -> Result<Vec<Payout>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut payouts: Vec<Payout> = state.payouts.values().filter(|p| p.room_id == room_id).cloned().collect();
        payouts.sort_by_key(|p| p.created_at);
        Ok(payouts)
    }

    async fn list_by_status(&self, statuses: &[PayoutStatus]) -> Result<Vec<Payout>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut payouts: Vec<Payout> = state
            .payouts
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.created_at);
        Ok(payouts)
    }

    async fn update(&self, payout: &Payout) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        match state.payouts.get_mut(&payout.id) {
            Some(existing) => {
                *existing = payout.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("payout {}", payout.id))),
        }
    }
}

#[async_trait]
impl ReconciliationRepository for InMemoryStore {
    async fn record(&self, failure: &CommitFailure) -> Result<(), StoreError> {
        self.check_online()?;
        self.state.write().await.failures.insert(failure.id, failure.clone());
        Ok(())
    }

    async fn find_by_payment_id(&self, payment_id: &str) -> Result<Option<CommitFailure>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state.failures.values().find(|f| f.payment_id == payment_id).cloned())
    }

    async fn list_by_status(&self, status: ReconciliationStatus) -> Result<Vec<CommitFailure>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state.failures.values().filter(|f| f.status == status).cloned().collect())
    }
}

#[derive(Default)]
struct ChannelState {
    scheduled: Vec<(DateTime<Utc>, Uuid)>,
    actions: HashMap<Uuid, (ExpiryAction, u32)>,
    inflight: HashSet<Uuid>,
    dead: VecDeque<DeadLetter>,
}

/// Delayed-action channel held in memory. Claims never lapse.
#[derive(Default, Clone)]
pub struct InMemoryChannel {
    state: Arc<Mutex<ChannelState>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Scheduled plus in-flight actions.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.scheduled.len() + state.inflight.len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.lock().dead.len()
    }

    pub fn push_dead_letter(&self, letter: DeadLetter) {
        self.lock().dead.push_back(letter);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), ChannelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::Backend("channel offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DelayedActionChannel for InMemoryChannel {
    async fn publish(&self, action: &ExpiryAction, fire_at: DateTime<Utc>) -> Result<(), ChannelError> {
        self.check_online()?;
        let mut state = self.lock();
        state.actions.insert(action.action_id, (action.clone(), 0));
        state.scheduled.push((fire_at, action.action_id));
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>, ChannelError> {
        self.check_online()?;
        let mut guard = self.lock();
        let state = &mut *guard;
        state.scheduled.sort_by_key(|(at, _)| *at);

        let due = state.scheduled.iter().take_while(|(at, _)| *at <= now).count().min(limit);
        let claimed: Vec<Uuid> = state.scheduled.drain(..due).map(|(_, id)| id).collect();

        let mut deliveries = Vec::with_capacity(claimed.len());
        for id in claimed {
            if let Some((action, attempts)) = state.actions.get_mut(&id) {
                *attempts += 1;
                deliveries.push(Delivery {
                    action: action.clone(),
                    attempts: *attempts,
                });
                state.inflight.insert(id);
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.check_online()?;
        let mut state = self.lock();
        state.inflight.remove(&delivery.action.action_id);
        state.actions.remove(&delivery.action.action_id);
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, fire_at: DateTime<Utc>) -> Result<(), ChannelError> {
        self.check_online()?;
        let mut state = self.lock();
        if state.inflight.remove(&delivery.action.action_id) {
            state.scheduled.push((fire_at, delivery.action.action_id));
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), ChannelError> {
        self.check_online()?;
        let raw = serde_json::to_string(&delivery.action).map_err(|e| ChannelError::Encode(e.to_string()))?;
        let mut state = self.lock();
        state.inflight.remove(&delivery.action.action_id);
        state.actions.remove(&delivery.action.action_id);
        state.dead.push_back(DeadLetter {
            action: Some(delivery.action.clone()),
            raw,
            reason: reason.to_string(),
            attempts: delivery.attempts,
        });
        Ok(())
    }

    async fn drain_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, ChannelError> {
        self.check_online()?;
        let mut state = self.lock();
        let n = state.dead.len().min(limit);
        Ok(state.dead.drain(..n).collect())
    }
}

/// Keeps every published event, in order.
#[derive(Default, Clone)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: DomainEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

#[derive(Default)]
struct MockProviderState {
    initiate_script: VecDeque<Result<String, ProviderError>>,
    statuses: HashMap<String, String>,
    fetch_failures: VecDeque<ProviderError>,
    refund_failure: Option<ProviderError>,
    submitted: Vec<PayoutInstruction>,
    refunds: Vec<(String, i64)>,
}

/// Scriptable payout gateway.
///
/// Unscripted submissions are accepted as `PROCESSING`. Transaction ids are
/// derived from the reference id, so resubmitting a reference returns the
/// same transaction.
#[derive(Default, Clone)]
pub struct MockPayoutProvider {
    state: Arc<Mutex<MockProviderState>>,
}

impl MockPayoutProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the outcome of the next submission: a provider status or an error.
    pub fn script_initiate(&self, outcome: Result<&str, ProviderError>) {
        self.lock().initiate_script.push_back(outcome.map(str::to_string));
    }

    pub fn fail_next_fetch(&self, err: ProviderError) {
        self.lock().fetch_failures.push_back(err);
    }

    pub fn fail_refunds(&self, err: Option<ProviderError>) {
        self.lock().refund_failure = err;
    }

    pub fn set_status(&self, transaction_id: &str, status: &str) {
        self.lock().statuses.insert(transaction_id.to_string(), status.to_string());
    }

    pub fn transaction_id_for(reference_id: &str) -> String {
        format!("mock_tx_{}", reference_id)
    }

    pub fn submissions(&self) -> Vec<PayoutInstruction> {
        self.lock().submitted.clone()
    }

    pub fn refunds(&self) -> Vec<(String, i64)> {
        self.lock().refunds.clone()
    }
}

#[async_trait]
impl PayoutProvider for MockPayoutProvider {
    async fn initiate_payout(&self, instruction: &PayoutInstruction) -> Result<ProviderPayout, ProviderError> {
        let mut state = self.lock();
        state.submitted.push(instruction.clone());

        let status = state
            .initiate_script
            .pop_front()
            .unwrap_or_else(|| Ok("PROCESSING".to_string()))?;
        let transaction_id = Self::transaction_id_for(&instruction.reference_id);
        state.statuses.insert(transaction_id.clone(), status.clone());

        Ok(ProviderPayout {
            transaction_id,
            status,
            utr: None,
            description: None,
        })
    }

    async fn fetch_status(&self, transaction_id: &str) -> Result<ProviderPayout, ProviderError> {
        let mut state = self.lock();
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }

        let status = state
            .statuses
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| ProviderError::Rejected(format!("unknown transaction {}", transaction_id)))?;
        let utr = (status == "SUCCESS").then(|| format!("UTR{}", transaction_id.len()));

        Ok(ProviderPayout {
            transaction_id: transaction_id.to_string(),
            status,
            utr,
            description: None,
        })
    }

    async fn refund(&self, payment_id: &str, amount: i64, _note: &str) -> Result<RefundReceipt, ProviderError> {
        let mut state = self.lock();
        if let Some(err) = state.refund_failure.clone() {
            return Err(err);
        }
        state.refunds.push((payment_id.to_string(), amount));
        Ok(RefundReceipt {
            refund_id: format!("rfnd_{}", payment_id),
            amount,
        })
    }
}
