use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{BookingStore, LedgerStore, ScreeningCatalog};
use crate::error::StoreError;
use crate::models::{
    Booking, BookingId, BookingStatus, LedgerEntry, PaymentAttempt, Screening, ScreeningId,
};

/// Хранилище в памяти процесса. Используется в тестах и для локального запуска.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledgers: RwLock<HashMap<ScreeningId, LedgerEntry>>,
    bookings: RwLock<HashMap<BookingId, Booking>>,
    attempts: RwLock<HashMap<BookingId, Vec<PaymentAttempt>>>,
    screenings: RwLock<HashMap<ScreeningId, Screening>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_screening(&self, screening: Screening) {
        self.screenings.write().await.insert(screening.id, screening);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load_ledger(&self, screening_id: ScreeningId) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.ledgers.read().await.get(&screening_id).cloned())
    }

    async fn insert_ledger(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut ledgers = self.ledgers.write().await;
        if ledgers.contains_key(&entry.screening_id) {
            return Err(StoreError::Duplicate(format!("ledger {}", entry.screening_id)));
        }
        ledgers.insert(entry.screening_id, entry.clone());
        Ok(())
    }

    async fn swap_ledger(&self, entry: &LedgerEntry, expected_version: u64) -> Result<bool, StoreError> {
        let mut ledgers = self.ledgers.write().await;
        match ledgers.get_mut(&entry.screening_id) {
            Some(current) if current.version == expected_version => {
                *current = entry.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn screening_ids(&self) -> Result<Vec<ScreeningId>, StoreError> {
        let mut ids: Vec<ScreeningId> = self.ledgers.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&booking.id) {
            return Err(StoreError::Duplicate(format!("booking {}", booking.id)));
        }
        bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn load_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.read().await.get(&id).cloned())
    }

    async fn swap_booking(&self, booking: &Booking, expected_version: u64) -> Result<bool, StoreError> {
        let mut bookings = self.bookings.write().await;
        match bookings.get_mut(&booking.id) {
            Some(current) if current.version == expected_version => {
                *current = booking.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_bookings(&self) -> Result<Vec<Booking>, StoreError> {
        let mut pending: Vec<Booking> = self
            .bookings
            .read()
            .await
            .values()
            .filter(|b| b.status == BookingStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|b| b.reservation_expiry);
        Ok(pending)
    }

    async fn save_attempt(&self, attempt: &PaymentAttempt) -> Result<(), StoreError> {
        let mut attempts = self.attempts.write().await;
        let list = attempts.entry(attempt.booking_id).or_default();
        match list.iter_mut().find(|a| a.attempt_id == attempt.attempt_id) {
            Some(existing) => *existing = attempt.clone(),
            None => list.push(attempt.clone()),
        }
        Ok(())
    }

    async fn attempts_for(&self, booking_id: BookingId) -> Result<Vec<PaymentAttempt>, StoreError> {
        Ok(self
            .attempts
            .read()
            .await
            .get(&booking_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ScreeningCatalog for MemoryStore {
    async fn screening(&self, id: ScreeningId) -> Result<Option<Screening>, StoreError> {
        Ok(self.screenings.read().await.get(&id).cloned())
    }
}
