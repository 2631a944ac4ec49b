//! Адаптер PostgreSQL.
//!
//! Состояния мест сеанса лежат одной строкой в `screening_ledgers.seat_states` (JSONB).
//! Compare-and-swap делается через `UPDATE ... WHERE version = $n` и проверку
//! `rows_affected()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::{BookingStore, LedgerStore, ScreeningCatalog};
use crate::database::Database;
use crate::error::StoreError;
use crate::models::{
    ActiveAttempt, AttemptId, Booking, BookingId, BookingStatus, LedgerEntry, PaymentAttempt,
    PaymentAttemptStatus, Screening, ScreeningId, SeatId, SeatState, UserId,
};

#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

// --- Строки таблиц ---

#[derive(FromRow)]
struct LedgerRow {
    screening_id: i64,
    capacity: i32,
    seat_states: Json<BTreeMap<SeatId, SeatState>>,
    version: i64,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            screening_id: ScreeningId(row.screening_id),
            capacity: row.capacity as u32,
            seat_states: row.seat_states.0,
            version: row.version as u64,
        }
    }
}

#[derive(FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: i64,
    screening_id: i64,
    seats: Json<BTreeSet<SeatId>>,
    status: String,
    total_amount: i64,
    reservation_expiry: DateTime<Utc>,
    failure_reason: Option<String>,
    attempts: i32,
    active_attempt_id: Option<String>,
    active_attempt_started_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = BookingStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("booking {} has status {}", row.id, row.status)))?;
        let active_attempt = match (row.active_attempt_id, row.active_attempt_started_at) {
            (Some(id), Some(started_at)) => Some(ActiveAttempt {
                attempt_id: AttemptId::from_raw(id),
                started_at,
            }),
            _ => None,
        };
        Ok(Booking {
            id: BookingId(row.id),
            user_id: UserId(row.user_id),
            screening_id: ScreeningId(row.screening_id),
            seats: row.seats.0,
            status,
            total_amount: row.total_amount,
            reservation_expiry: row.reservation_expiry,
            failure_reason: row.failure_reason,
            attempts: row.attempts as u32,
            active_attempt,
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AttemptRow {
    attempt_id: String,
    booking_id: Uuid,
    sequence: i32,
    status: String,
    retry_count: i32,
    amount: i64,
    transaction_id: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for PaymentAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let status = PaymentAttemptStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("payment attempt {} has status {}", row.attempt_id, row.status))
        })?;
        Ok(PaymentAttempt {
            attempt_id: AttemptId::from_raw(row.attempt_id),
            booking_id: BookingId(row.booking_id),
            sequence: row.sequence as u32,
            status,
            retry_count: row.retry_count as u32,
            amount: row.amount,
            transaction_id: row.transaction_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const BOOKING_COLUMNS: &str = "id, user_id, screening_id, seats, status, total_amount, \
     reservation_expiry, failure_reason, attempts, active_attempt_id, active_attempt_started_at, \
     version, created_at, updated_at";

#[async_trait]
impl LedgerStore for PgStore {
    async fn load_ledger(&self, screening_id: ScreeningId) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerRow>(
            "SELECT screening_id, capacity, seat_states, version
             FROM screening_ledgers
             WHERE screening_id = $1",
        )
        .bind(screening_id.0)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(row.map(LedgerEntry::from))
    }

    async fn insert_ledger(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO screening_ledgers (screening_id, capacity, seat_states, version)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (screening_id) DO NOTHING",
        )
        .bind(entry.screening_id.0)
        .bind(entry.capacity as i32)
        .bind(Json(&entry.seat_states))
        .bind(entry.version as i64)
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!("ledger {}", entry.screening_id)));
        }
        Ok(())
    }

    async fn swap_ledger(&self, entry: &LedgerEntry, expected_version: u64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE screening_ledgers
             SET seat_states = $1, version = $2, updated_at = NOW()
             WHERE screening_id = $3 AND version = $4",
        )
        .bind(Json(&entry.seat_states))
        .bind(entry.version as i64)
        .bind(entry.screening_id.0)
        .bind(expected_version as i64)
        .execute(&self.db.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn screening_ids(&self) -> Result<Vec<ScreeningId>, StoreError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT screening_id FROM screening_ledgers ORDER BY screening_id")
                .fetch_all(&self.db.pool)
                .await?;
        Ok(ids.into_iter().map(ScreeningId).collect())
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError> {
        let (attempt_id, started_at) = split_active_attempt(booking);
        let result = sqlx::query(
            "INSERT INTO bookings (id, user_id, screening_id, seats, status, total_amount,
                                   reservation_expiry, failure_reason, attempts, active_attempt_id,
                                   active_attempt_started_at, version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(booking.id.0)
        .bind(booking.user_id.0)
        .bind(booking.screening_id.0)
        .bind(Json(&booking.seats))
        .bind(booking.status.as_str())
        .bind(booking.total_amount)
        .bind(booking.reservation_expiry)
        .bind(&booking.failure_reason)
        .bind(booking.attempts as i32)
        .bind(attempt_id)
        .bind(started_at)
        .bind(booking.version as i64)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.db.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!("booking {}", booking.id)));
        }
        Ok(())
    }

    async fn load_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE id = $1",
            BOOKING_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn swap_booking(&self, booking: &Booking, expected_version: u64) -> Result<bool, StoreError> {
        let (attempt_id, started_at) = split_active_attempt(booking);
        let result = sqlx::query(
            "UPDATE bookings
             SET status = $1, failure_reason = $2, attempts = $3, active_attempt_id = $4,
                 active_attempt_started_at = $5, version = $6, updated_at = $7
             WHERE id = $8 AND version = $9",
        )
        .bind(booking.status.as_str())
        .bind(&booking.failure_reason)
        .bind(booking.attempts as i32)
        .bind(attempt_id)
        .bind(started_at)
        .bind(booking.version as i64)
        .bind(booking.updated_at)
        .bind(booking.id.0)
        .bind(expected_version as i64)
        .execute(&self.db.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_bookings(&self) -> Result<Vec<Booking>, StoreError> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE status = 'PENDING' ORDER BY reservation_expiry",
            BOOKING_COLUMNS
        ))
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn save_attempt(&self, attempt: &PaymentAttempt) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO payment_attempts (attempt_id, booking_id, sequence, status, retry_count,
                                           amount, transaction_id, last_error, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (attempt_id) DO UPDATE
             SET status = EXCLUDED.status,
                 retry_count = EXCLUDED.retry_count,
                 transaction_id = EXCLUDED.transaction_id,
                 last_error = EXCLUDED.last_error,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(attempt.attempt_id.as_str())
        .bind(attempt.booking_id.0)
        .bind(attempt.sequence as i32)
        .bind(attempt.status.as_str())
        .bind(attempt.retry_count as i32)
        .bind(attempt.amount)
        .bind(&attempt.transaction_id)
        .bind(&attempt.last_error)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.db.pool)
        .await?;

        Ok(())
    }

    async fn attempts_for(&self, booking_id: BookingId) -> Result<Vec<PaymentAttempt>, StoreError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            "SELECT attempt_id, booking_id, sequence, status, retry_count, amount,
                    transaction_id, last_error, created_at, updated_at
             FROM payment_attempts
             WHERE booking_id = $1
             ORDER BY sequence",
        )
        .bind(booking_id.0)
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter().map(PaymentAttempt::try_from).collect()
    }
}

#[async_trait]
impl ScreeningCatalog for PgStore {
    async fn screening(&self, id: ScreeningId) -> Result<Option<Screening>, StoreError> {
        let row: Option<(i64, i32, i64)> =
            sqlx::query_as("SELECT id, capacity, price_minor FROM screenings WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.db.pool)
                .await?;

        Ok(row.map(|(id, capacity, price)| Screening {
            id: ScreeningId(id),
            capacity: capacity as u32,
            price,
        }))
    }
}

fn split_active_attempt(booking: &Booking) -> (Option<String>, Option<DateTime<Utc>>) {
    match &booking.active_attempt {
        Some(active) => (Some(active.attempt_id.as_str().to_string()), Some(active.started_at)),
        None => (None, None),
    }
}
