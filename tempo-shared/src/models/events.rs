use chrono::NaiveDate;
use uuid::Uuid;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationAction {
    Held,
    Extended,
    Released,
    Expired,
    /// Held slots converted into a booking.
    Booked,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct SlotReservation {
    pub slot_id: u32,
    pub holder_id: Option<String>,
    pub expires_at: Option<i64>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct ReservationUpdatedEvent {
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub action: ReservationAction,
    pub slots: Vec<SlotReservation>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct SessionStatusChangedEvent {
    pub booking_id: Uuid,
    pub room_id: Uuid,
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PayoutStatusChangedEvent {
    pub payout_id: Uuid,
    pub booking_id: Uuid,
    pub room_id: Uuid,
    pub status: String,
    pub details: Option<String>,
    pub timestamp: i64,
}

/// Raised when a captured payment could not be turned into a booking.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct CommitFailedEvent {
    pub payment_id: String,
    pub user_id: String,
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub conflicting_slots: Vec<u32>,
    pub refunded: bool,
    pub timestamp: i64,
}

/// Everything pushed to connected clients and to the events topic.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ReservationUpdated(ReservationUpdatedEvent),
    SessionStatusChanged(SessionStatusChangedEvent),
    PayoutStatusChanged(PayoutStatusChangedEvent),
    CommitFailed(CommitFailedEvent),
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::ReservationUpdated(_) => "reservation_updated",
            DomainEvent::SessionStatusChanged(_) => "session_status_changed",
            DomainEvent::PayoutStatusChanged(_) => "payout_status_changed",
            DomainEvent::CommitFailed(_) => "commit_failed",
        }
    }

    pub fn room_id(&self) -> Uuid {
        match self {
            DomainEvent::ReservationUpdated(e) => e.room_id,
            DomainEvent::SessionStatusChanged(e) => e.room_id,
            DomainEvent::PayoutStatusChanged(e) => e.room_id,
            DomainEvent::CommitFailed(e) => e.room_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged_by_kind() {
        let event = DomainEvent::SessionStatusChanged(SessionStatusChangedEvent {
            booking_id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            status: "ONGOING".to_string(),
            timestamp: 0,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_status_changed");
        assert_eq!(json["status"], "ONGOING");
        assert_eq!(event.kind(), "session_status_changed");
    }
}
