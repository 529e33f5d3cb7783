use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tempo_core::{Hold, HoldSnapshot};
use uuid::Uuid;

type ShardKey = (Uuid, NaiveDate);

/// Volatile hold table, sharded by (room, date).
///
/// Shard critical sections are synchronous, so no caller can hold a shard
/// across a network call.
#[derive(Default)]
pub struct HoldTable {
    shards: RwLock<HashMap<ShardKey, Arc<Mutex<HoldSnapshot>>>>,
}

impl HoldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the holds of one room on one date.
    pub fn with_shard<R>(&self, room_id: Uuid, date: NaiveDate, f: impl FnOnce(&mut HoldSnapshot) -> R) -> R {
        let key = (room_id, date);
        {
            let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(shard) = shards.get(&key) {
                let mut holds = shard.lock().unwrap_or_else(PoisonError::into_inner);
                return f(&mut holds);
            }
        }

        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        let shard = shards.entry(key).or_default();
        let mut holds = shard.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut holds)
    }

    pub fn snapshot(&self, room_id: Uuid, date: NaiveDate) -> HoldSnapshot {
        self.with_shard(room_id, date, |holds| holds.clone())
    }

    /// Live holds of one room on one date.
    pub fn live(&self, room_id: Uuid, date: NaiveDate, now: DateTime<Utc>) -> HashMap<u32, Hold> {
        self.with_shard(room_id, date, |holds| {
            holds
                .iter()
                .filter(|(_, h)| h.is_live(now))
                .map(|(id, h)| (*id, h.clone()))
                .collect()
        })
    }

    /// Drop expired holds and empty shards. Returns the number of holds dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = 0;
        shards.retain(|_, shard| {
            let mut holds = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = holds.len();
            holds.retain(|_, h| h.is_live(now));
            dropped += before - holds.len();
            !holds.is_empty()
        });
        dropped
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
