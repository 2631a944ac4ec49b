use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::payment::AttemptId;
use super::screening::ScreeningId;
use super::seat::SeatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(pub Uuid);

impl BookingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Failed => "FAILED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(BookingStatus::Pending),
            "CONFIRMED" => Some(BookingStatus::Confirmed),
            "FAILED" => Some(BookingStatus::Failed),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }

    /// Из терминальных состояний переходов нет.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Failed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Попытка оплаты, которая сейчас ждёт ответа шлюза.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAttempt {
    pub attempt_id: AttemptId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub screening_id: ScreeningId,
    pub seats: BTreeSet<SeatId>,
    pub status: BookingStatus,
    pub total_amount: i64,
    pub reservation_expiry: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub active_attempt: Option<ActiveAttempt>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn pending(
        id: BookingId,
        user_id: UserId,
        screening_id: ScreeningId,
        seats: BTreeSet<SeatId>,
        price: i64,
        reservation_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_amount = seats.len() as i64 * price;
        Self {
            id,
            user_id,
            screening_id,
            seats,
            status: BookingStatus::Pending,
            total_amount,
            reservation_expiry,
            failure_reason: None,
            attempts: 0,
            active_attempt: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.reservation_expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn total_amount_is_seat_count_times_price() {
        let now = Utc::now();
        let seats: BTreeSet<SeatId> = ["A1", "A2", "A3"].into_iter().map(SeatId::new).collect();
        let booking = Booking::pending(
            BookingId::new(),
            UserId(1),
            ScreeningId(5),
            seats,
            1500,
            now + Duration::minutes(10),
            now,
        );
        assert_eq!(booking.total_amount, 4500);
        assert_eq!(booking.status, BookingStatus::Pending);
        assert!(!booking.is_expired(now));
        assert!(booking.is_expired(now + Duration::minutes(11)));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [BookingStatus::Confirmed, BookingStatus::Failed, BookingStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                BookingStatus::Pending,
                BookingStatus::Confirmed,
                BookingStatus::Failed,
                BookingStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(BookingStatus::Pending.can_transition_to(BookingStatus::Cancelled));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [BookingStatus::Pending, BookingStatus::Failed] {
            assert_eq!(BookingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BookingStatus::parse("paid"), None);
    }
}
