use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A provisional claim on one slot. Slots acquired together share a `batch_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
    pub batch_id: Uuid,
}

impl Hold {
    /// A hold is unusable at and after `expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Holds keyed by slot id for one (room, date), as seen at a point in time.
pub type HoldSnapshot = HashMap<u32, Hold>;

/// Compensating expiry action scheduled for a hold batch.
///
/// `action_id` is unique per publish; extending a hold publishes a fresh
/// action for the same `batch_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryAction {
    pub action_id: Uuid,
    pub batch_id: Uuid,
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slot_ids: Vec<u32>,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl ExpiryAction {
    pub fn new(
        batch_id: Uuid,
        room_id: Uuid,
        date: NaiveDate,
        slot_ids: Vec<u32>,
        holder_id: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action_id: Uuid::new_v4(),
            batch_id,
            room_id,
            date,
            slot_ids,
            holder_id,
            expires_at,
        }
    }
}
