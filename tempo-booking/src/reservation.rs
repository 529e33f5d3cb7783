use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tempo_core::channel::{ChannelError, DelayedActionChannel};
use tempo_core::events::EventPublisher;
use tempo_core::repository::{RoomRepository, StoreError};
use tempo_core::{Clock, ExpiryAction, Hold, HoldSnapshot, Room, Slot};
use tempo_shared::models::events::{ReservationAction, ReservationUpdatedEvent, SlotReservation};
use tempo_shared::DomainEvent;
use tempo_store::app_config::BusinessRules;
use tracing::{info, warn};
use uuid::Uuid;

use crate::holds::HoldTable;

#[derive(Debug, thiserror::Error)]
pub enum HoldError {
    #[error("Slots unavailable: {0:?}")]
    Conflict(Vec<u32>),
    #[error("Slots {slots:?} are not held by {holder}")]
    NotOwner { holder: String, slots: Vec<u32> },
    #[error("Invalid hold request: {0}")]
    Invalid(String),
    #[error("Room not found: {0}")]
    RoomNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Result of a successful acquire or extend.
#[derive(Debug, Clone, Serialize)]
pub struct HoldGrant {
    pub batch_id: Uuid,
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slot_ids: Vec<u32>,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Provisional, time-bounded claims on room slots.
///
/// Every acquire and extend schedules a compensating expiry action on the
/// delayed channel, so holds are released even if this process dies.
pub struct ReservationStore {
    table: HoldTable,
    rooms: Arc<dyn RoomRepository>,
    channel: Arc<dyn DelayedActionChannel>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    hold_ttl: Duration,
    max_extension_minutes: i64,
}

impl ReservationStore {
    pub fn new(
        rooms: Arc<dyn RoomRepository>,
        channel: Arc<dyn DelayedActionChannel>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        rules: &BusinessRules,
    ) -> Self {
        Self {
            table: HoldTable::new(),
            rooms,
            channel,
            publisher,
            clock,
            hold_ttl: Duration::seconds(rules.hold_ttl_seconds as i64),
            max_extension_minutes: rules.max_extension_minutes,
        }
    }

    pub async fn acquire_hold(
        &self,
        room_id: Uuid,
        date: NaiveDate,
        slot_ids: &[u32],
        holder_id: &str,
    ) -> Result<HoldGrant, HoldError> {
        validate_batch(slot_ids, holder_id)?;
        let room = self.load_room(room_id).await?;
        if let Some(unknown) = unknown_slots(&room, slot_ids) {
            return Err(HoldError::Invalid(format!("unknown slots {:?}", unknown)));
        }

        // Permanent bookings first
        let booked = self.booked_among(room_id, date, slot_ids).await?;
        if !booked.is_empty() {
            return Err(HoldError::Conflict(booked));
        }

        let now = self.clock.now();
        let hold = Hold {
            holder_id: holder_id.to_string(),
            expires_at: now + self.hold_ttl,
            batch_id: Uuid::new_v4(),
        };

        let previous = self.table.with_shard(room_id, date, |holds| {
            let mut taken: Vec<u32> = slot_ids
                .iter()
                .copied()
                .filter(|id| {
                    holds
                        .get(id)
                        .is_some_and(|h| h.is_live(now) && h.holder_id != holder_id)
                })
                .collect();
            if !taken.is_empty() {
                taken.sort_unstable();
                return Err(HoldError::Conflict(taken));
            }

            Ok(slot_ids
                .iter()
                .map(|id| (*id, holds.insert(*id, hold.clone())))
                .collect::<Vec<_>>())
        })?;

        // A commit may have landed between the first check and the write
        match self.booked_among(room_id, date, slot_ids).await {
            Ok(booked) if booked.is_empty() => {}
            Ok(booked) => {
                self.restore(room_id, date, hold.batch_id, previous);
                return Err(HoldError::Conflict(booked));
            }
            Err(e) => {
                self.restore(room_id, date, hold.batch_id, previous);
                return Err(e);
            }
        }

        let action = ExpiryAction::new(
            hold.batch_id,
            room_id,
            date,
            slot_ids.to_vec(),
            holder_id.to_string(),
            hold.expires_at,
        );
        if let Err(e) = self.channel.publish(&action, hold.expires_at).await {
            warn!("Could not schedule expiry for batch {}: {}", hold.batch_id, e);
            self.restore(room_id, date, hold.batch_id, previous);
            return Err(e.into());
        }

        info!(
            room_id = %room_id,
            %date,
            holder = holder_id,
            "Held slots {:?} until {}",
            slot_ids,
            hold.expires_at
        );
        let slots = reservations(slot_ids, Some(holder_id), Some(hold.expires_at));
        self.announce(room_id, date, ReservationAction::Held, slots, now).await;

        Ok(HoldGrant {
            batch_id: hold.batch_id,
            room_id,
            date,
            slot_ids: slot_ids.to_vec(),
            holder_id: holder_id.to_string(),
            expires_at: hold.expires_at,
        })
    }

    /// Idempotent: slots without a hold are skipped. Returns the slots released.
    pub async fn release_hold(&self, room_id: Uuid, date: NaiveDate, slot_ids: &[u32]) -> Result<Vec<u32>, HoldError> {
        let released = self.table.with_shard(room_id, date, |holds| {
            slot_ids
                .iter()
                .copied()
                .filter(|id| holds.remove(id).is_some())
                .collect::<Vec<_>>()
        });

        if !released.is_empty() {
            info!(room_id = %room_id, %date, "Released slots {:?}", released);
            let slots = reservations(&released, None, None);
            self.announce(room_id, date, ReservationAction::Released, slots, self.clock.now())
                .await;
        }
        Ok(released)
    }

    pub async fn extend_hold(
        &self,
        room_id: Uuid,
        date: NaiveDate,
        slot_ids: &[u32],
        additional_minutes: i64,
        holder_id: &str,
    ) -> Result<HoldGrant, HoldError> {
        validate_batch(slot_ids, holder_id)?;
        if additional_minutes <= 0 || additional_minutes > self.max_extension_minutes {
            return Err(HoldError::Invalid(format!(
                "extension must be between 1 and {} minutes",
                self.max_extension_minutes
            )));
        }

        let now = self.clock.now();
        let bump = Duration::minutes(additional_minutes);

        let previous = self.table.with_shard(room_id, date, |holds| {
            let mut not_owned: Vec<u32> = slot_ids
                .iter()
                .copied()
                .filter(|id| {
                    !holds
                        .get(id)
                        .is_some_and(|h| h.is_live(now) && h.holder_id == holder_id)
                })
                .collect();
            if !not_owned.is_empty() {
                not_owned.sort_unstable();
                return Err(HoldError::NotOwner {
                    holder: holder_id.to_string(),
                    slots: not_owned,
                });
            }

            let mut previous = Vec::with_capacity(slot_ids.len());
            for id in slot_ids {
                if let Some(h) = holds.get_mut(id) {
                    previous.push((*id, h.clone()));
                    h.expires_at += bump;
                }
            }
            Ok(previous)
        })?;

        let batch_id = previous.first().map(|(_, h)| h.batch_id).unwrap_or_else(Uuid::new_v4);
        let expires_at = previous
            .iter()
            .map(|(_, h)| h.expires_at + bump)
            .max()
            .unwrap_or(now + bump);

        let action = ExpiryAction::new(batch_id, room_id, date, slot_ids.to_vec(), holder_id.to_string(), expires_at);
        if let Err(e) = self.channel.publish(&action, expires_at).await {
            warn!("Could not schedule expiry for extended batch {}: {}", batch_id, e);
            self.table.with_shard(room_id, date, |holds| {
                for (id, prev) in &previous {
                    if let Some(current) = holds.get_mut(id) {
                        if current.holder_id == prev.holder_id {
                            current.expires_at = prev.expires_at;
                        }
                    }
                }
            });
            return Err(e.into());
        }

        info!(room_id = %room_id, %date, holder = holder_id, "Extended slots {:?} to {}", slot_ids, expires_at);
        let slots = reservations(slot_ids, Some(holder_id), Some(expires_at));
        self.announce(room_id, date, ReservationAction::Extended, slots, now).await;

        Ok(HoldGrant {
            batch_id,
            room_id,
            date,
            slot_ids: slot_ids.to_vec(),
            holder_id: holder_id.to_string(),
            expires_at,
        })
    }

    /// Every slot of the room on `date` with its live hold or permanent booking.
    pub async fn query_holds(&self, room_id: Uuid, date: NaiveDate) -> Result<Vec<Slot>, HoldError> {
        let room = self.load_room(room_id).await?;
        let booked: HashMap<u32, String> = self
            .rooms
            .booked_slots(room_id, date)
            .await?
            .into_iter()
            .map(|m| (m.slot_id, m.booked_by))
            .collect();
        let live = self.table.live(room_id, date, self.clock.now());

        Ok(room
            .slots
            .iter()
            .map(|t| Slot::from_template(t, booked.get(&t.slot_id).cloned()).with_hold(live.get(&t.slot_id)))
            .collect())
    }

    /// Holds of one room on one date as they are now, for commit validation.
    pub fn snapshot(&self, room_id: Uuid, date: NaiveDate) -> HoldSnapshot {
        self.table.snapshot(room_id, date)
    }

    /// Drop the holds a booking has just converted.
    pub async fn convert(&self, room_id: Uuid, date: NaiveDate, slot_ids: &[u32], holder_id: &str) {
        let removed = self.remove_owned(room_id, date, slot_ids, holder_id, |_| true);
        if !removed.is_empty() {
            info!(room_id = %room_id, %date, "Converted holds {:?} into a booking", removed);
        }
        let slots = reservations(slot_ids, Some(holder_id), None);
        self.announce(room_id, date, ReservationAction::Booked, slots, self.clock.now())
            .await;
    }

    /// Release whatever `holder_id` still holds among `slot_ids`.
    pub async fn release_owned(&self, room_id: Uuid, date: NaiveDate, slot_ids: &[u32], holder_id: &str) -> Vec<u32> {
        let released = self.remove_owned(room_id, date, slot_ids, holder_id, |_| true);
        if !released.is_empty() {
            let slots = reservations(&released, None, None);
            self.announce(room_id, date, ReservationAction::Released, slots, self.clock.now())
                .await;
        }
        released
    }

    /// Release the holds of `action` that are still owned by its holder and
    /// have actually run out. Extended or re-acquired holds are left alone.
    pub async fn expire(&self, action: &ExpiryAction, now: DateTime<Utc>) -> Vec<u32> {
        let expired = self.remove_owned(action.room_id, action.date, &action.slot_ids, &action.holder_id, |h| {
            !h.is_live(now)
        });
        if !expired.is_empty() {
            info!(
                room_id = %action.room_id,
                date = %action.date,
                batch_id = %action.batch_id,
                "Expired holds {:?}",
                expired
            );
            let slots = reservations(&expired, None, None);
            self.announce(action.room_id, action.date, ReservationAction::Expired, slots, now)
                .await;
        }
        expired
    }

    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        self.table.prune(now)
    }

    fn remove_owned(
        &self,
        room_id: Uuid,
        date: NaiveDate,
        slot_ids: &[u32],
        holder_id: &str,
        eligible: impl Fn(&Hold) -> bool,
    ) -> Vec<u32> {
        self.table.with_shard(room_id, date, |holds| {
            let mut removed = Vec::new();
            for id in slot_ids {
                if holds.get(id).is_some_and(|h| h.holder_id == holder_id && eligible(h)) {
                    holds.remove(id);
                    removed.push(*id);
                }
            }
            removed
        })
    }

    /// Undo an acquire whose follow-up steps failed.
    fn restore(&self, room_id: Uuid, date: NaiveDate, batch_id: Uuid, previous: Vec<(u32, Option<Hold>)>) {
        self.table.with_shard(room_id, date, |holds| {
            for (id, prev) in previous {
                if holds.get(&id).is_some_and(|h| h.batch_id == batch_id) {
                    match prev {
                        Some(p) => holds.insert(id, p),
                        None => holds.remove(&id),
                    };
                }
            }
        });
    }

    async fn load_room(&self, room_id: Uuid) -> Result<Room, HoldError> {
        self.rooms
            .get_room(room_id)
            .await?
            .ok_or(HoldError::RoomNotFound(room_id))
    }

    async fn booked_among(&self, room_id: Uuid, date: NaiveDate, slot_ids: &[u32]) -> Result<Vec<u32>, HoldError> {
        let booked: HashSet<u32> = self
            .rooms
            .booked_slots(room_id, date)
            .await?
            .into_iter()
            .map(|m| m.slot_id)
            .collect();
        let mut hits: Vec<u32> = slot_ids.iter().copied().filter(|id| booked.contains(id)).collect();
        hits.sort_unstable();
        Ok(hits)
    }

    async fn announce(
        &self,
        room_id: Uuid,
        date: NaiveDate,
        action: ReservationAction,
        slots: Vec<SlotReservation>,
        now: DateTime<Utc>,
    ) {
        self.publisher
            .publish(DomainEvent::ReservationUpdated(ReservationUpdatedEvent {
                room_id,
                date,
                action,
                slots,
                timestamp: now.timestamp_millis(),
            }))
            .await;
    }
}

fn reservations(slot_ids: &[u32], holder_id: Option<&str>, expires_at: Option<DateTime<Utc>>) -> Vec<SlotReservation> {
    slot_ids
        .iter()
        .map(|id| SlotReservation {
            slot_id: *id,
            holder_id: holder_id.map(str::to_string),
            expires_at: expires_at.map(|t| t.timestamp_millis()),
        })
        .collect()
}

fn validate_batch(slot_ids: &[u32], holder_id: &str) -> Result<(), HoldError> {
    if holder_id.trim().is_empty() {
        return Err(HoldError::Invalid("holder_id is required".to_string()));
    }
    if slot_ids.is_empty() {
        return Err(HoldError::Invalid("at least one slot is required".to_string()));
    }
    let mut seen = HashSet::new();
    if !slot_ids.iter().all(|id| seen.insert(*id)) {
        return Err(HoldError::Invalid("duplicate slot ids".to_string()));
    }
    Ok(())
}

fn unknown_slots(room: &Room, slot_ids: &[u32]) -> Option<Vec<u32>> {
    let unknown: Vec<u32> = slot_ids.iter().copied().filter(|id| room.slot(*id).is_none()).collect();
    (!unknown.is_empty()).then_some(unknown)
}
