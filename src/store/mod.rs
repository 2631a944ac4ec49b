//! Адаптеры хранения: реестры мест, бронирования, попытки оплаты и каталог сеансов.
//!
//! Движок работает только через эти трейты. Атомарность записи обеспечивается
//! compare-and-swap по полю `version`: запись проходит, только если версия в хранилище
//! совпадает с ожидаемой.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Booking, BookingId, LedgerEntry, PaymentAttempt, Screening, ScreeningId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_ledger(&self, screening_id: ScreeningId) -> Result<Option<LedgerEntry>, StoreError>;

    /// Fails with `StoreError::Duplicate` if an entry already exists.
    async fn insert_ledger(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Writes `entry` only if the stored version equals `expected_version`.
    /// Returns `false` on a version mismatch.
    async fn swap_ledger(&self, entry: &LedgerEntry, expected_version: u64) -> Result<bool, StoreError>;

    async fn screening_ids(&self) -> Result<Vec<ScreeningId>, StoreError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError>;

    async fn load_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    async fn swap_booking(&self, booking: &Booking, expected_version: u64) -> Result<bool, StoreError>;

    async fn pending_bookings(&self) -> Result<Vec<Booking>, StoreError>;

    /// Upsert by `attempt_id`.
    async fn save_attempt(&self, attempt: &PaymentAttempt) -> Result<(), StoreError>;

    async fn attempts_for(&self, booking_id: BookingId) -> Result<Vec<PaymentAttempt>, StoreError>;
}

/// Каталог сеансов принадлежит внешнему слою; движку нужны только вместимость и цена.
#[async_trait]
pub trait ScreeningCatalog: Send + Sync {
    async fn screening(&self, id: ScreeningId) -> Result<Option<Screening>, StoreError>;
}
