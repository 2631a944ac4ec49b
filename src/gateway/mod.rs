//! Внешний платёжный шлюз.
//!
//! Шлюз обязан быть идемпотентным по ключу: повторный `charge` с тем же ключом не списывает
//! деньги второй раз, а возвращает результат первого списания.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AttemptId, PaymentDetails};

pub mod http;
pub mod mock;

pub use http::{CircuitBreaker, CircuitState, HttpPaymentGateway};
pub use mock::{GatewayStep, ScriptedGateway};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeOutcome {
    Succeeded { transaction_id: String },
    /// Окончательный отказ, повторять бессмысленно.
    Declined { reason: String },
    /// Временный сбой: таймаут, 5xx, разомкнутый выключатель.
    GatewayError { reason: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn charge(
        &self,
        idempotency_key: &AttemptId,
        amount_minor: i64,
        details: &PaymentDetails,
    ) -> ChargeOutcome;
}
