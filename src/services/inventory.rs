//! inventory.rs
//!
//! Резервирование, подтверждение и освобождение мест поверх реестра сеанса.
//! Все изменения проходят через `ConcurrencyController`; внутри критической секции только
//! чтение реестра, чистое вычисление и одна CAS-запись.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::locking::ConcurrencyController;
use crate::clock::Clock;
use crate::error::{EngineError, StoreError};
use crate::models::{Availability, BookingId, LedgerEntry, Screening, ScreeningId, SeatId};
use crate::store::LedgerStore;

/// Результат успешного резервирования.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationToken {
    /// Совпадает с id брони-держателя.
    pub reservation_id: BookingId,
    pub screening_id: ScreeningId,
    pub seats: BTreeSet<SeatId>,
    /// Версия реестра до изменения.
    pub version: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreeningSnapshot {
    pub entry: LedgerEntry,
    pub availability: Availability,
}

pub struct SeatInventory {
    store: Arc<dyn LedgerStore>,
    controller: Arc<ConcurrencyController>,
    clock: Arc<dyn Clock>,
    hold_duration: Duration,
}

impl SeatInventory {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        controller: Arc<ConcurrencyController>,
        clock: Arc<dyn Clock>,
        hold_duration: Duration,
    ) -> Self {
        Self {
            store,
            controller,
            clock,
            hold_duration,
        }
    }

    /// Создаёт реестр сеанса: все места свободны, версия 0.
    pub async fn open_screening(
        &self,
        screening: &Screening,
        seat_ids: impl IntoIterator<Item = SeatId>,
    ) -> Result<LedgerEntry, EngineError> {
        let entry = LedgerEntry::new(screening.id, seat_ids);
        if entry.capacity == 0 {
            return Err(EngineError::InvalidRequest("seat layout is empty".to_string()));
        }
        if entry.capacity != screening.capacity {
            return Err(EngineError::InvalidRequest(format!(
                "seat layout has {} seats, screening capacity is {}",
                entry.capacity, screening.capacity
            )));
        }

        match self.store.insert_ledger(&entry).await {
            Ok(()) => {
                info!(
                    screening_id = %screening.id,
                    capacity = entry.capacity,
                    "🎬 Screening ledger opened"
                );
                Ok(entry)
            }
            Err(StoreError::Duplicate(_)) => Err(EngineError::DuplicateScreening(screening.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Free -> Held(holder) для всех мест сразу либо ни для одного.
    pub async fn reserve(
        &self,
        screening_id: ScreeningId,
        seat_ids: &[SeatId],
        holder: BookingId,
    ) -> Result<ReservationToken, EngineError> {
        let seats: BTreeSet<SeatId> = seat_ids.iter().cloned().collect();
        if seats.is_empty() {
            return Err(EngineError::InvalidRequest("no seats requested".to_string()));
        }
        let expires_at = self.clock.now() + self.hold_duration;

        let version = self
            .controller
            .with_screening_lock(screening_id, |entry| {
                let before = entry.version;
                entry.hold(&seats, holder, expires_at)?;
                Ok(before)
            })
            .await?;

        info!(
            screening_id = %screening_id,
            booking_id = %holder,
            seats = seats.len(),
            "🎫 Seats held"
        );

        Ok(ReservationToken {
            reservation_id: holder,
            screening_id,
            seats,
            version,
            expires_at,
        })
    }

    /// Held(holder) -> Booked(holder) ровно для переданных мест.
    pub async fn confirm(
        &self,
        screening_id: ScreeningId,
        seats: &BTreeSet<SeatId>,
        holder: BookingId,
    ) -> Result<(), EngineError> {
        let result = self
            .controller
            .with_screening_lock(screening_id, |entry| entry.confirm(seats, holder))
            .await;

        match &result {
            Ok(()) => info!(
                screening_id = %screening_id,
                booking_id = %holder,
                seats = seats.len(),
                "✅ Seats booked"
            ),
            Err(e @ EngineError::InvalidStateTransition { .. }) => error!(
                screening_id = %screening_id,
                booking_id = %holder,
                error = %e,
                "Seats are no longer held by the booking"
            ),
            Err(_) => {}
        }
        result
    }

    /// Held/Booked(holder) -> Free. Свободные места и места другого держателя не трогаются.
    pub async fn release(
        &self,
        screening_id: ScreeningId,
        seats: &BTreeSet<SeatId>,
        holder: BookingId,
    ) -> Result<Vec<SeatId>, EngineError> {
        let (freed, foreign) = self
            .controller
            .with_screening_lock(screening_id, |entry| {
                let foreign: Vec<SeatId> = seats
                    .iter()
                    .filter(|id| {
                        entry
                            .state_of(id)
                            .and_then(|s| s.holder())
                            .is_some_and(|h| h != holder)
                    })
                    .cloned()
                    .collect();
                Ok((entry.release(seats, holder), foreign))
            })
            .await?;

        if !foreign.is_empty() {
            warn!(
                screening_id = %screening_id,
                booking_id = %holder,
                seats = ?foreign,
                "Skipped seats owned by another booking during release"
            );
        }
        if !freed.is_empty() {
            info!(
                screening_id = %screening_id,
                booking_id = %holder,
                seats = freed.len(),
                "🔓 Seats released"
            );
        }
        Ok(freed)
    }

    /// Снимает все временные брони держателя в сеансе, проданные места остаются.
    pub async fn release_holder(
        &self,
        screening_id: ScreeningId,
        holder: BookingId,
    ) -> Result<Vec<SeatId>, EngineError> {
        self.controller
            .with_screening_lock(screening_id, |entry| Ok(entry.release_holds_of(holder)))
            .await
    }

    pub async fn snapshot(&self, screening_id: ScreeningId) -> Result<ScreeningSnapshot, EngineError> {
        let entry = self
            .store
            .load_ledger(screening_id)
            .await?
            .ok_or(EngineError::ScreeningNotFound(screening_id))?;
        let availability = entry.availability();
        Ok(ScreeningSnapshot { entry, availability })
    }

    pub async fn availability(&self, screening_id: ScreeningId) -> Result<Availability, EngineError> {
        Ok(self.snapshot(screening_id).await?.availability)
    }
}
