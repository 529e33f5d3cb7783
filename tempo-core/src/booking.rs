use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::room::{BookedSlot, Slot};
use crate::CoreError;

/// Session status of a booking
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    NotStarted,
    Ongoing,
    Completed,
    Terminated,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::NotStarted => "NOT_STARTED",
            BookingStatus::Ongoing => "ONGOING",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Terminated => "TERMINATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Terminated)
    }

    /// NOT_STARTED → ONGOING → COMPLETED, with TERMINATED reachable only
    /// before COMPLETED.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::NotStarted, BookingStatus::Ongoing)
                | (BookingStatus::Ongoing, BookingStatus::Completed)
                | (BookingStatus::NotStarted, BookingStatus::Terminated)
                | (BookingStatus::Ongoing, BookingStatus::Terminated)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(BookingStatus::NotStarted),
            "ONGOING" => Ok(BookingStatus::Ongoing),
            "COMPLETED" => Ok(BookingStatus::Completed),
            "TERMINATED" => Ok(BookingStatus::Terminated),
            other => Err(CoreError::ValidationError(format!("unknown booking status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundDetails {
    pub amount: i64,
    pub percentage: u8,
    pub refund_id: String,
    pub processed_at: DateTime<Utc>,
}

/// Request to turn held slots into a booking once payment has been captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitRequest {
    pub user_id: String,
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slots: Vec<BookedSlot>,
    /// Captured amount in the smallest currency unit.
    pub amount: i64,
    pub payment_id: String,
}

impl CommitRequest {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.user_id.trim().is_empty() {
            return Err(CoreError::ValidationError("user_id is required".to_string()));
        }
        if self.payment_id.trim().is_empty() {
            return Err(CoreError::ValidationError("payment_id is required".to_string()));
        }
        if self.slots.is_empty() {
            return Err(CoreError::ValidationError("at least one slot is required".to_string()));
        }
        if self.amount < 0 {
            return Err(CoreError::ValidationError("amount cannot be negative".to_string()));
        }
        let mut seen = HashSet::new();
        if !self.slots.iter().all(|s| seen.insert(s.slot_id)) {
            return Err(CoreError::ValidationError("duplicate slot ids".to_string()));
        }
        Ok(())
    }

    pub fn slot_ids(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.slot_id).collect()
    }
}

/// Checks the current state of a room's slots against a commit request.
///
/// Returns the ids of every requested slot that is missing, booked, held by
/// someone else, not covered by a live hold of the requester, or whose times
/// differ from the room's slot.
pub fn validate_commit(slots: &[Slot], request: &CommitRequest, now: DateTime<Utc>) -> Result<(), Vec<u32>> {
    let mut conflicts = Vec::new();

    for requested in &request.slots {
        let current = match slots.iter().find(|s| s.slot_id == requested.slot_id) {
            Some(s) => s,
            None => {
                conflicts.push(requested.slot_id);
                continue;
            }
        };

        if requested.start_time != current.start_time
            || requested.end_time != current.end_time
            || current.is_booked
            || current.held_by_other(&request.user_id, now)
            || !current.has_live_hold_of(&request.user_id, now)
        {
            conflicts.push(requested.slot_id);
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(conflicts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: String,
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub slots: Vec<BookedSlot>,
    pub status: BookingStatus,
    pub total_amount: i64,
    pub payment_id: String,
    pub refund: Option<RefundDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn from_commit(request: &CommitRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            room_id: request.room_id,
            date: request.date,
            slots: request.slots.clone(),
            status: BookingStatus::NotStarted,
            total_amount: request.amount,
            payment_id: request.payment_id.clone(),
            refund: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing the forward-only state machine.
    pub fn transition(&mut self, next: BookingStatus, now: DateTime<Utc>) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn terminate(&mut self, refund: Option<RefundDetails>, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(BookingStatus::Terminated, now)?;
        self.refund = refund;
        Ok(())
    }

    /// `[earliest start, latest end)` of the booked slots, anchored to the
    /// booking date in the room's local time zone. A slot whose end is not
    /// after its start runs past midnight.
    pub fn session_window(&self, tz: &Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mut window: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

        for slot in &self.slots {
            let start = local_to_utc(tz, self.date.and_time(slot.start_time))?;
            let mut end_naive = self.date.and_time(slot.end_time);
            if slot.end_time <= slot.start_time {
                end_naive += Duration::days(1);
            }
            let end = local_to_utc(tz, end_naive)?;

            window = Some(match window {
                None => (start, end),
                Some((s, e)) => (s.min(start), e.max(end)),
            });
        }

        window
    }
}

fn local_to_utc(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive).earliest().map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    ManualReview,
    Refunded,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::ManualReview => "MANUAL_REVIEW",
            ReconciliationStatus::Refunded => "REFUNDED",
        }
    }
}

impl FromStr for ReconciliationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL_REVIEW" => Ok(ReconciliationStatus::ManualReview),
            "REFUNDED" => Ok(ReconciliationStatus::Refunded),
            other => Err(CoreError::ValidationError(format!("unknown reconciliation status {}", other))),
        }
    }
}

/// Ledger entry for a payment that was captured but could not be booked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFailure {
    pub id: Uuid,
    pub payment_id: String,
    pub user_id: String,
    pub room_id: Uuid,
    pub date: NaiveDate,
    pub amount: i64,
    pub conflicting_slots: Vec<u32>,
    pub status: ReconciliationStatus,
    pub refund_id: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CommitFailure {
    pub fn new(request: &CommitRequest, conflicting_slots: Vec<u32>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: request.payment_id.clone(),
            user_id: request.user_id.clone(),
            room_id: request.room_id,
            date: request.date,
            amount: request.amount,
            conflicting_slots,
            status: ReconciliationStatus::ManualReview,
            refund_id: None,
            detail: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hold::Hold;
    use crate::room::SlotTemplate;
    use chrono::NaiveTime;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn request(slots: Vec<BookedSlot>) -> CommitRequest {
        CommitRequest {
            user_id: "user-a".to_string(),
            room_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            slots,
            amount: 1000,
            payment_id: "pay_1".to_string(),
        }
    }

    fn booked_slot(id: u32, start: u32, end: u32) -> BookedSlot {
        BookedSlot {
            slot_id: id,
            start_time: hm(start, 0),
            end_time: hm(end, 0),
        }
    }

    #[test]
    fn test_status_lifecycle() {
        let mut booking = Booking::from_commit(&request(vec![booked_slot(1, 9, 10)]), Utc::now());
        assert_eq!(booking.status, BookingStatus::NotStarted);

        booking.transition(BookingStatus::Ongoing, Utc::now()).unwrap();
        booking.transition(BookingStatus::Completed, Utc::now()).unwrap();
        assert_eq!(booking.status, BookingStatus::Completed);
    }

    #[test]
    fn test_invalid_transition() {
        let mut booking = Booking::from_commit(&request(vec![booked_slot(1, 9, 10)]), Utc::now());

        // Cannot skip ONGOING
        assert!(booking.transition(BookingStatus::Completed, Utc::now()).is_err());

        booking.transition(BookingStatus::Ongoing, Utc::now()).unwrap();
        assert!(booking.transition(BookingStatus::NotStarted, Utc::now()).is_err());
        booking.transition(BookingStatus::Completed, Utc::now()).unwrap();

        let result = booking.terminate(None, Utc::now());
        assert_eq!(
            result,
            Err(CoreError::InvalidTransition {
                from: "COMPLETED".to_string(),
                to: "TERMINATED".to_string()
            })
        );
    }

    #[test]
    fn test_terminate_before_completion_keeps_refund() {
        let mut booking = Booking::from_commit(&request(vec![booked_slot(1, 9, 10)]), Utc::now());
        let refund = RefundDetails {
            amount: 800,
            percentage: 80,
            refund_id: "rfnd_1".to_string(),
            processed_at: Utc::now(),
        };

        booking.terminate(Some(refund.clone()), Utc::now()).unwrap();
        assert_eq!(booking.status, BookingStatus::Terminated);
        assert_eq!(booking.refund, Some(refund));
        assert!(booking.transition(BookingStatus::Ongoing, Utc::now()).is_err());
    }

    #[test]
    fn test_session_window_in_local_time() {
        let booking = Booking::from_commit(
            &request(vec![booked_slot(3, 15, 16), booked_slot(2, 14, 15)]),
            Utc::now(),
        );

        let (start, end) = booking.session_window(&chrono_tz::Asia::Kolkata).unwrap();
        // 14:00 IST is 08:30 UTC
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_session_window_past_midnight() {
        let booking = Booking::from_commit(&request(vec![booked_slot(9, 23, 0)]), Utc::now());

        let (start, end) = booking.session_window(&chrono_tz::UTC).unwrap();
        assert_eq!(end - start, Duration::hours(1));
    }

    #[test]
    fn test_commit_request_validation() {
        assert!(request(vec![booked_slot(1, 9, 10)]).validate().is_ok());
        assert!(request(vec![]).validate().is_err());
        assert!(request(vec![booked_slot(1, 9, 10), booked_slot(1, 9, 10)]).validate().is_err());

        let mut no_payment = request(vec![booked_slot(1, 9, 10)]);
        no_payment.payment_id = " ".to_string();
        assert!(no_payment.validate().is_err());
    }

    #[test]
    fn test_validate_commit_requires_live_hold() {
        let now = Utc::now();
        let template = SlotTemplate {
            slot_id: 1,
            start_time: hm(9, 0),
            end_time: hm(10, 0),
        };
        let req = request(vec![booked_slot(1, 9, 10)]);

        let own = Hold {
            holder_id: "user-a".to_string(),
            expires_at: now + Duration::minutes(1),
            batch_id: Uuid::new_v4(),
        };
        let live = vec![Slot::from_template(&template, None).with_hold(Some(&own))];
        assert!(validate_commit(&live, &req, now).is_ok());

        // Stale hold
        assert_eq!(validate_commit(&live, &req, now + Duration::minutes(1)), Err(vec![1]));

        // No hold at all
        let free = vec![Slot::from_template(&template, None)];
        assert_eq!(validate_commit(&free, &req, now), Err(vec![1]));

        // Someone else's hold
        let other = Hold {
            holder_id: "user-b".to_string(),
            ..own.clone()
        };
        let taken = vec![Slot::from_template(&template, None).with_hold(Some(&other))];
        assert_eq!(validate_commit(&taken, &req, now), Err(vec![1]));

        // Booked
        let booked = vec![Slot::from_template(&template, Some("user-c".to_string()))];
        assert_eq!(validate_commit(&booked, &req, now), Err(vec![1]));

        // Unknown slot
        assert_eq!(validate_commit(&[], &req, now), Err(vec![1]));

        // Times that do not match the room's slot
        let shifted = request(vec![booked_slot(1, 7, 8)]);
        assert_eq!(validate_commit(&live, &shifted, now), Err(vec![1]));
    }
}
