use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::booking::BookingId;
use crate::error::EngineError;

/// Идентификатор попытки оплаты, он же ключ идемпотентности для шлюза.
/// Одинаков для всех повторов одной попытки, различается между попытками.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    pub fn for_booking(booking_id: BookingId, sequence: u32) -> Self {
        Self(format!("{}:{}", booking_id, sequence))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentAttemptStatus {
    Initiated,
    AwaitingGateway,
    Succeeded,
    Declined,
    GatewayError,
}

impl PaymentAttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentAttemptStatus::Initiated => "INITIATED",
            PaymentAttemptStatus::AwaitingGateway => "AWAITING_GATEWAY",
            PaymentAttemptStatus::Succeeded => "SUCCEEDED",
            PaymentAttemptStatus::Declined => "DECLINED",
            PaymentAttemptStatus::GatewayError => "GATEWAY_ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INITIATED" => Some(PaymentAttemptStatus::Initiated),
            "AWAITING_GATEWAY" => Some(PaymentAttemptStatus::AwaitingGateway),
            "SUCCEEDED" => Some(PaymentAttemptStatus::Succeeded),
            "DECLINED" => Some(PaymentAttemptStatus::Declined),
            "GATEWAY_ERROR" => Some(PaymentAttemptStatus::GatewayError),
            _ => None,
        }
    }

    /// GatewayError терминален только после исчерпания повторов, поэтому здесь
    /// он считается нетерминальным: из него ещё можно вернуться в AwaitingGateway.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentAttemptStatus::Succeeded | PaymentAttemptStatus::Declined
        )
    }

    pub fn can_transition_to(&self, next: PaymentAttemptStatus) -> bool {
        use PaymentAttemptStatus::*;
        matches!(
            (self, next),
            (Initiated, AwaitingGateway)
                | (AwaitingGateway, Succeeded)
                | (AwaitingGateway, Declined)
                | (AwaitingGateway, GatewayError)
                | (GatewayError, AwaitingGateway)
        )
    }
}

impl fmt::Display for PaymentAttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Платёжные данные клиента. Карточные данные сюда не попадают, только токен.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub payment_token: String,
    pub email: Option<String>,
    pub description: Option<String>,
}

impl PaymentDetails {
    pub fn new(payment_token: impl Into<String>) -> Self {
        Self {
            payment_token: payment_token.into(),
            email: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub attempt_id: AttemptId,
    pub booking_id: BookingId,
    pub sequence: u32,
    pub status: PaymentAttemptStatus,
    pub retry_count: u32,
    pub amount: i64,
    pub transaction_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn initiated(booking_id: BookingId, sequence: u32, amount: i64, now: DateTime<Utc>) -> Self {
        Self {
            attempt_id: AttemptId::for_booking(booking_id, sequence),
            booking_id,
            sequence,
            status: PaymentAttemptStatus::Initiated,
            retry_count: 0,
            amount,
            transaction_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, next: PaymentAttemptStatus, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::invalid_state(
                self.status.as_str(),
                format!("payment attempt cannot move to {}", next),
            ));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
