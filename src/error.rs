//! error.rs
//!
//! Таксономия ошибок движка бронирования.
//!
//! Каждая ошибка, видимая клиенту, несёт стабильный машиночитаемый код (`code()`) и
//! категорию (`kind()`). Детали блокировок и версий наружу не выдаются.

use crate::models::{BookingId, ScreeningId, SeatId};

/// Ошибки уровня хранилища (PostgreSQL, миграции, Redis).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Категория ошибки с точки зрения вызывающей стороны.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Клиент может повторить запрос с другими параметрами.
    Recoverable,
    /// Ошибка последовательности вызовов или входных данных.
    Client,
    /// Нарушение целостности, требует алерта.
    Fatal,
    /// Недоступность хранилища или исчерпанный бюджет повторов.
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("seats unavailable: {}", join_seats(.seats))]
    SeatUnavailable { seats: Vec<SeatId> },

    #[error("unknown seats for this screening: {}", join_seats(.seats))]
    UnknownSeats { seats: Vec<SeatId> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("screening {0} not found")]
    ScreeningNotFound(ScreeningId),

    #[error("screening {0} already has a seat ledger")]
    DuplicateScreening(ScreeningId),

    #[error("booking {0} not found")]
    NotFound(BookingId),

    #[error("booking {0} does not belong to the caller")]
    NotOwner(BookingId),

    #[error("invalid state {status}: {reason}")]
    InvalidState { status: String, reason: String },

    #[error("reservation for booking {booking_id} has expired")]
    ReservationExpired { booking_id: BookingId },

    #[error("payment declined: {reason}")]
    PaymentDeclined { reason: String },

    #[error("seats not held by this reservation: {}", join_seats(.seats))]
    InvalidStateTransition { seats: Vec<SeatId> },

    #[error("integrity violation on booking {booking_id}: {reason}")]
    IntegrityViolation { booking_id: BookingId, reason: String },

    #[error("concurrency conflict: retry budget exhausted")]
    ConcurrencyConflict,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Стабильный код для клиентов и алертинга.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SeatUnavailable { .. } => "SEAT_UNAVAILABLE",
            EngineError::UnknownSeats { .. } => "UNKNOWN_SEATS",
            EngineError::InvalidRequest(_) => "INVALID_REQUEST",
            EngineError::ScreeningNotFound(_) => "SCREENING_NOT_FOUND",
            EngineError::DuplicateScreening(_) => "DUPLICATE_SCREENING",
            EngineError::NotFound(_) => "BOOKING_NOT_FOUND",
            EngineError::NotOwner(_) => "NOT_OWNER",
            EngineError::InvalidState { .. } => "INVALID_STATE",
            EngineError::ReservationExpired { .. } => "RESERVATION_EXPIRED",
            EngineError::PaymentDeclined { .. } => "PAYMENT_DECLINED",
            EngineError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
            EngineError::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            EngineError::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SeatUnavailable { .. } | EngineError::ReservationExpired { .. } => {
                ErrorKind::Recoverable
            }
            EngineError::InvalidStateTransition { .. } | EngineError::IntegrityViolation { .. } => {
                ErrorKind::Fatal
            }
            EngineError::ConcurrencyConflict | EngineError::Store(_) => ErrorKind::Infrastructure,
            _ => ErrorKind::Client,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Сообщение для конечного пользователя: без внутренних деталей хранилища.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Store(_) => "Service temporarily unavailable, please retry".to_string(),
            EngineError::ConcurrencyConflict => {
                "Too many concurrent requests for this screening, please retry".to_string()
            }
            EngineError::InvalidStateTransition { .. } | EngineError::IntegrityViolation { .. } => {
                "Booking could not be finalized, support has been notified".to_string()
            }
            other => other.to_string(),
        }
    }

    pub(crate) fn invalid_state(status: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidState {
            status: status.into(),
            reason: reason.into(),
        }
    }
}

fn join_seats(seats: &[SeatId]) -> String {
    seats
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_unavailable_names_every_seat() {
        let err = EngineError::SeatUnavailable {
            seats: vec![SeatId::new("A1"), SeatId::new("A2")],
        };
        assert_eq!(err.code(), "SEAT_UNAVAILABLE");
        assert_eq!(err.kind(), ErrorKind::Recoverable);
        assert_eq!(err.to_string(), "seats unavailable: A1, A2");
    }

    #[test]
    fn integrity_faults_are_fatal() {
        let err = EngineError::InvalidStateTransition {
            seats: vec![SeatId::new("B1")],
        };
        assert!(err.is_fatal());
        assert!(!err.user_message().contains("B1"));
    }

    #[test]
    fn store_errors_hide_details_from_users() {
        let err = EngineError::from(StoreError::Corrupt("version column is null".into()));
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        assert!(!err.user_message().contains("version"));
    }
}
