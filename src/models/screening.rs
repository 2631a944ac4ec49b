//! Реестр мест сеанса (Screening Ledger).
//!
//! `LedgerEntry` хранит авторитетное состояние всех мест одного сеанса. Методы переходов
//! здесь чистые: они не трогают `version` и не делают I/O. Версию увеличивает
//! `ConcurrencyController` при фиксации изменения.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::booking::BookingId;
use super::seat::{SeatId, SeatState};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScreeningId(pub i64);

impl fmt::Display for ScreeningId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Данные каталога о сеансе: вместимость и цена места (в минимальных единицах валюты).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screening {
    pub id: ScreeningId,
    pub capacity: u32,
    pub price: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub capacity: u32,
    pub free: u32,
    pub held: u32,
    pub booked: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub screening_id: ScreeningId,
    pub capacity: u32,
    pub seat_states: BTreeMap<SeatId, SeatState>,
    pub version: u64,
}

impl LedgerEntry {
    /// Новый реестр: все места свободны, вместимость равна числу мест в схеме зала.
    pub fn new(screening_id: ScreeningId, seats: impl IntoIterator<Item = SeatId>) -> Self {
        let seat_states: BTreeMap<SeatId, SeatState> =
            seats.into_iter().map(|id| (id, SeatState::Free)).collect();
        Self {
            screening_id,
            capacity: seat_states.len() as u32,
            seat_states,
            version: 0,
        }
    }

    /// Прямоугольный зал `rows x per_row`.
    pub fn grid(screening_id: ScreeningId, rows: u32, per_row: u32) -> Self {
        let seats = (0..rows).flat_map(|r| (0..per_row).map(move |n| SeatId::from_position(r, n)));
        Self::new(screening_id, seats)
    }

    pub fn state_of(&self, seat: &SeatId) -> Option<&SeatState> {
        self.seat_states.get(seat)
    }

    pub fn unknown_seats(&self, seats: &BTreeSet<SeatId>) -> Vec<SeatId> {
        seats
            .iter()
            .filter(|id| !self.seat_states.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Free -> Held для всех мест сразу. Если хоть одно место занято, ничего не меняется.
    pub fn hold(
        &mut self,
        seats: &BTreeSet<SeatId>,
        holder: BookingId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let unknown = self.unknown_seats(seats);
        if !unknown.is_empty() {
            return Err(EngineError::UnknownSeats { seats: unknown });
        }

        let taken: Vec<SeatId> = seats
            .iter()
            .filter(|id| !self.seat_states[*id].is_free())
            .cloned()
            .collect();
        if !taken.is_empty() {
            return Err(EngineError::SeatUnavailable { seats: taken });
        }

        let occupied = self.capacity - self.availability().free;
        if occupied as usize + seats.len() > self.capacity as usize {
            return Err(EngineError::SeatUnavailable {
                seats: seats.iter().cloned().collect(),
            });
        }

        for id in seats {
            self.seat_states
                .insert(id.clone(), SeatState::Held { holder, expires_at });
        }
        Ok(())
    }

    /// Held(holder) -> Booked(holder) ровно для переданных мест.
    pub fn confirm(&mut self, seats: &BTreeSet<SeatId>, holder: BookingId) -> Result<(), EngineError> {
        let not_held: Vec<SeatId> = seats
            .iter()
            .filter(|id| {
                !matches!(
                    self.seat_states.get(*id),
                    Some(SeatState::Held { holder: h, .. }) if *h == holder
                )
            })
            .cloned()
            .collect();
        if !not_held.is_empty() {
            return Err(EngineError::InvalidStateTransition { seats: not_held });
        }

        for id in seats {
            self.seat_states
                .insert(id.clone(), SeatState::Booked { holder });
        }
        Ok(())
    }

    /// Held/Booked(holder) -> Free. Свободные места и места другого держателя не трогаются.
    /// Возвращает реально освобождённые места.
    pub fn release(&mut self, seats: &BTreeSet<SeatId>, holder: BookingId) -> Vec<SeatId> {
        let mut freed = Vec::new();
        for id in seats {
            if let Some(state) = self.seat_states.get_mut(id) {
                if state.holder() == Some(holder) {
                    *state = SeatState::Free;
                    freed.push(id.clone());
                }
            }
        }
        freed
    }

    /// Снимает все временные брони держателя (проданные места остаются).
    pub fn release_holds_of(&mut self, holder: BookingId) -> Vec<SeatId> {
        let mut freed = Vec::new();
        for (id, state) in self.seat_states.iter_mut() {
            if matches!(state, SeatState::Held { holder: h, .. } if *h == holder) {
                *state = SeatState::Free;
                freed.push(id.clone());
            }
        }
        freed
    }

    /// Держатели временных броней и самое раннее время истечения их мест.
    pub fn hold_owners(&self) -> BTreeMap<BookingId, DateTime<Utc>> {
        let mut owners: BTreeMap<BookingId, DateTime<Utc>> = BTreeMap::new();
        for state in self.seat_states.values() {
            if let SeatState::Held { holder, expires_at } = state {
                owners
                    .entry(*holder)
                    .and_modify(|e| *e = (*e).min(*expires_at))
                    .or_insert(*expires_at);
            }
        }
        owners
    }

    pub fn availability(&self) -> Availability {
        let mut availability = Availability {
            capacity: self.capacity,
            free: 0,
            held: 0,
            booked: 0,
        };
        for state in self.seat_states.values() {
            match state {
                SeatState::Free => availability.free += 1,
                SeatState::Held { .. } => availability.held += 1,
                SeatState::Booked { .. } => availability.booked += 1,
            }
        }
        availability
    }

    /// count(Held) + count(Booked) <= capacity.
    pub fn within_capacity(&self) -> bool {
        let a = self.availability();
        a.held + a.booked <= self.capacity
    }
}
