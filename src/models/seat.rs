use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::booking::BookingId;

/// Идентификатор места в зале: буква ряда + номер, например `A1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeatId(String);

impl SeatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_uppercase())
    }

    /// Место по позиции в сетке зала (ряды и номера с нуля): `(0, 0)` -> `A1`, `(26, 4)` -> `AA5`.
    pub fn from_position(row: u32, number: u32) -> Self {
        let mut letters = Vec::new();
        let mut n = row + 1;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        let row_label: String = letters.into_iter().rev().collect();
        Self(format!("{}{}", row_label, number + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SeatId {
    fn from(value: &str) -> Self {
        SeatId::new(value)
    }
}

/// Состояние места в реестре сеанса.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatState {
    Free,
    /// Временная бронь до оплаты.
    Held {
        holder: BookingId,
        expires_at: DateTime<Utc>,
    },
    Booked {
        holder: BookingId,
    },
}

impl SeatState {
    pub fn is_free(&self) -> bool {
        matches!(self, SeatState::Free)
    }

    pub fn holder(&self) -> Option<BookingId> {
        match self {
            SeatState::Free => None,
            SeatState::Held { holder, .. } | SeatState::Booked { holder } => Some(*holder),
        }
    }
}
