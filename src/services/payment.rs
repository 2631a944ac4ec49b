//! payment.rs
//!
//! Машина состояний одной попытки оплаты.
//!
//! `Initiated -> AwaitingGateway -> {Succeeded | Declined | GatewayError}`. Из `GatewayError`
//! попытка возвращается в `AwaitingGateway`, пока не исчерпан `max_retries`; после этого
//! `GatewayError` окончателен. Все повторы идут с тем же ключом идемпотентности.
//! Блокировки мест здесь не держатся.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::gateway::{ChargeOutcome, PaymentGateway};
use crate::models::{Booking, PaymentAttempt, PaymentAttemptStatus, PaymentDetails};
use crate::store::BookingStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Повторы после первого вызова шлюза.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Таймаут одного вызова шлюза.
    pub gateway_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
            gateway_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Задержка перед повтором номер `retry` (с единицы): base * 2^(retry-1), не больше max.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct PaymentProcessor {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl PaymentProcessor {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
            policy,
        }
    }

    /// Проводит попытку номер `sequence` до терминального состояния.
    ///
    /// Возвращённая попытка всегда в `Succeeded`, `Declined` или `GatewayError`
    /// (последнее означает исчерпанные повторы).
    pub async fn execute(
        &self,
        booking: &Booking,
        sequence: u32,
        details: &PaymentDetails,
    ) -> Result<PaymentAttempt, EngineError> {
        let mut attempt =
            PaymentAttempt::initiated(booking.id, sequence, booking.total_amount, self.clock.now());
        self.persist(&attempt).await;

        info!(
            booking_id = %booking.id,
            attempt_id = %attempt.attempt_id,
            amount = attempt.amount,
            gateway = self.gateway.name(),
            "💳 Payment attempt started"
        );

        loop {
            attempt.advance(PaymentAttemptStatus::AwaitingGateway, self.clock.now())?;
            self.persist(&attempt).await;

            let outcome = match tokio::time::timeout(
                self.policy.gateway_timeout,
                self.gateway.charge(&attempt.attempt_id, attempt.amount, details),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => ChargeOutcome::GatewayError {
                    reason: format!(
                        "gateway did not answer within {} ms",
                        self.policy.gateway_timeout.as_millis()
                    ),
                },
            };

            match outcome {
                ChargeOutcome::Succeeded { transaction_id } => {
                    attempt.transaction_id = Some(transaction_id);
                    attempt.advance(PaymentAttemptStatus::Succeeded, self.clock.now())?;
                    self.persist(&attempt).await;
                    info!(
                        attempt_id = %attempt.attempt_id,
                        retries = attempt.retry_count,
                        "✅ Payment succeeded"
                    );
                    return Ok(attempt);
                }
                ChargeOutcome::Declined { reason } => {
                    attempt.last_error = Some(reason);
                    attempt.advance(PaymentAttemptStatus::Declined, self.clock.now())?;
                    self.persist(&attempt).await;
                    info!(attempt_id = %attempt.attempt_id, "❌ Payment declined");
                    return Ok(attempt);
                }
                ChargeOutcome::GatewayError { reason } => {
                    warn!(
                        attempt_id = %attempt.attempt_id,
                        retry = attempt.retry_count,
                        reason = %reason,
                        "Payment gateway error"
                    );
                    attempt.last_error = Some(reason);
                    attempt.advance(PaymentAttemptStatus::GatewayError, self.clock.now())?;

                    if attempt.retry_count >= self.policy.max_retries {
                        self.persist(&attempt).await;
                        warn!(
                            attempt_id = %attempt.attempt_id,
                            retries = attempt.retry_count,
                            "Payment retries exhausted"
                        );
                        return Ok(attempt);
                    }

                    attempt.retry_count += 1;
                    self.persist(&attempt).await;
                    tokio::time::sleep(self.policy.delay_for(attempt.retry_count)).await;
                }
            }
        }
    }

    /// Сбой записи попытки не прерывает оплату: деньги важнее журнала.
    async fn persist(&self, attempt: &PaymentAttempt) {
        if let Err(e) = self.store.save_attempt(attempt).await {
            warn!(
                attempt_id = %attempt.attempt_id,
                status = %attempt.status,
                error = %e,
                "Failed to persist payment attempt"
            );
        }
    }
}
