use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_shared::Masked;
use uuid::Uuid;

use crate::hold::Hold;

/// Wall-clock times travel as "HH:MM", the way owners configure them.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .map_err(|e| format!("invalid time '{}': {}", raw, e))
    }
}

/// A bookable interval offered by a room every day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotTemplate {
    pub slot_id: u32,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub owner_name: String,
    /// Registered payout destination of the owner (UPI address).
    pub payout_destination: Option<Masked<String>>,
    pub slots: Vec<SlotTemplate>,
}

impl Room {
    pub fn slot(&self, slot_id: u32) -> Option<&SlotTemplate> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }
}

/// A slot as carried on a booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookedSlot {
    pub slot_id: u32,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl From<&SlotTemplate> for BookedSlot {
    fn from(t: &SlotTemplate) -> Self {
        Self {
            slot_id: t.slot_id,
            start_time: t.start_time,
            end_time: t.end_time,
        }
    }
}

/// State of one slot of a room on one date.
///
/// `is_booked` and `reserved_by` are never both set: [`Slot::with_hold`]
/// ignores holds on booked slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub slot_id: u32,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub is_booked: bool,
    pub booked_by: Option<String>,
    pub reserved_by: Option<String>,
    pub reservation_expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn from_template(template: &SlotTemplate, booked_by: Option<String>) -> Self {
        Self {
            slot_id: template.slot_id,
            start_time: template.start_time,
            end_time: template.end_time,
            is_booked: booked_by.is_some(),
            booked_by,
            reserved_by: None,
            reservation_expires_at: None,
        }
    }

    pub fn with_hold(mut self, hold: Option<&Hold>) -> Self {
        match hold {
            Some(h) if !self.is_booked => {
                self.reserved_by = Some(h.holder_id.clone());
                self.reservation_expires_at = Some(h.expires_at);
            }
            _ => {
                self.reserved_by = None;
                self.reservation_expires_at = None;
            }
        }
        self
    }

    pub fn held_by_other(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        match (&self.reserved_by, self.reservation_expires_at) {
            (Some(holder), Some(expires)) => holder != user_id && expires > now,
            _ => false,
        }
    }

    pub fn has_live_hold_of(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        match (&self.reserved_by, self.reservation_expires_at) {
            (Some(holder), Some(expires)) => holder == user_id && expires > now,
            _ => false,
        }
    }
}
