//! http.rs
//!
//! HTTP-клиент платёжного шлюза.
//!
//! Ключевые компоненты:
//! 1.  **CircuitBreaker**: "автоматический выключатель" перед внешним API. После серии сбоев
//!     перестаёт пускать запросы, пока не истечёт таймаут.
//! 2.  **HttpPaymentGateway**: отправляет списание, подписывает запрос токеном SHA-256 и
//!     передаёт ключ идемпотентности в заголовке `Idempotency-Key`. Все вызовы проходят
//!     через `CircuitBreaker`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::{ChargeOutcome, PaymentGateway};
use crate::config::{CircuitBreakerConfig, PaymentConfig};
use crate::models::{AttemptId, PaymentDetails};

/// Состояния "автоматического выключателя".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Нормальный режим, запросы разрешены.
    Closed,
    /// Запросы временно запрещены после серии сбоев.
    Open,
    /// После таймаута в Open пропускаем пробный запрос.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    /// Счётчик последовательных сбоев.
    failure_count: AtomicU32,
    /// Когда выключатель разомкнулся в последний раз.
    opened_at: Mutex<Option<Instant>>,
    failure_threshold: u32,
    timeout_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            failure_threshold: failure_threshold.max(1),
            timeout_duration: Duration::from_secs(timeout_seconds),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.timeout_seconds)
    }

    /// Можно ли выполнить следующий запрос.
    pub fn can_execute(&self) -> bool {
        let state = *self.state.read().unwrap_or_else(PoisonError::into_inner);

        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock().unwrap_or_else(PoisonError::into_inner);
                let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);

                if elapsed >= self.timeout_duration {
                    *self.state.write().unwrap_or_else(PoisonError::into_inner) = CircuitState::HalfOpen;
                    info!("Circuit breaker transitioning to HalfOpen state");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == CircuitState::HalfOpen {
            info!("Circuit breaker recovered - transitioning to Closed state");
        }
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let failure_count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match *state {
            CircuitState::Closed if failure_count >= self.failure_threshold => {
                *state = CircuitState::Open;
                self.mark_opened();
                error!(
                    "Circuit breaker OPENED - {} failures reached threshold {}",
                    failure_count, self.failure_threshold
                );
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                self.mark_opened();
                warn!("Circuit breaker test failed - returning to Open state");
            }
            _ => {}
        }
    }

    pub fn get_state(&self) -> CircuitState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_opened(&self) {
        *self.opened_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

// --- Модели данных API шлюза ---

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    amount: i64,
    #[serde(rename = "orderId")]
    order_id: &'a str,
    currency: &'a str,
    #[serde(rename = "paymentToken")]
    payment_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    success: bool,
    status: Option<String>,
    #[serde(rename = "paymentId")]
    payment_id: Option<String>,
    code: Option<i32>,
    message: Option<String>,
}

pub struct HttpPaymentGateway {
    team_slug: String,
    password: String,
    base_url: String,
    currency: String,
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
}

impl HttpPaymentGateway {
    pub fn from_config(config: &PaymentConfig, breaker: &CircuitBreakerConfig) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout(Duration::from_secs(config.timeout_secs)))
            .build()?;

        Ok(Self {
            team_slug: config.merchant_id.clone(),
            password: config.merchant_password.clone(),
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            currency: config.currency.clone(),
            http_client,
            circuit_breaker: CircuitBreaker::from_config(breaker),
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.get_state()
    }

    /// Токен запроса: SHA-256 от amount + currency + orderId + password + teamSlug.
    fn generate_token(&self, amount: i64, order_id: &str) -> String {
        request_token(amount, &self.currency, order_id, &self.password, &self.team_slug)
    }

    async fn send_charge(
        &self,
        key: &AttemptId,
        amount: i64,
        details: &PaymentDetails,
    ) -> Result<ChargeResponse, String> {
        let request = ChargeRequest {
            team_slug: &self.team_slug,
            token: self.generate_token(amount, key.as_str()),
            amount,
            order_id: key.as_str(),
            currency: &self.currency,
            payment_token: &details.payment_token,
            description: details.description.as_deref(),
            email: details.email.as_deref(),
        };

        let response = self
            .http_client
            .post(format!("{}/payments/charge", self.base_url))
            .header("Idempotency-Key", key.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("transport error: {}", e))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(format!("gateway responded with {}", status));
        }

        response
            .json::<ChargeResponse>()
            .await
            .map_err(|e| format!("malformed gateway response ({}): {}", status, e))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn charge(&self, key: &AttemptId, amount_minor: i64, details: &PaymentDetails) -> ChargeOutcome {
        if !self.circuit_breaker.can_execute() {
            warn!(attempt_id = %key, "Circuit breaker is OPEN - blocking payment gateway request");
            return ChargeOutcome::GatewayError {
                reason: "circuit breaker open".to_string(),
            };
        }

        match self.send_charge(key, amount_minor, details).await {
            Ok(response) => {
                self.circuit_breaker.record_success();
                interpret(response)
            }
            Err(reason) => {
                error!(attempt_id = %key, "Payment gateway request failed: {}", reason);
                self.circuit_breaker.record_failure();
                ChargeOutcome::GatewayError { reason }
            }
        }
    }
}

fn interpret(response: ChargeResponse) -> ChargeOutcome {
    let status = response.status.as_deref().unwrap_or("").to_ascii_uppercase();
    let message = || {
        response
            .message
            .clone()
            .or_else(|| response.code.map(|c| format!("gateway code {}", c)))
            .unwrap_or_else(|| format!("status {}", status))
    };

    match (response.success, status.as_str()) {
        (true, "CONFIRMED" | "AUTHORIZED" | "COMPLETED") => match response.payment_id.clone() {
            Some(transaction_id) => ChargeOutcome::Succeeded { transaction_id },
            None => ChargeOutcome::GatewayError {
                reason: "successful charge without payment id".to_string(),
            },
        },
        (_, "REJECTED" | "FAILED" | "CANCELLED" | "DECLINED") | (false, _) => {
            ChargeOutcome::Declined { reason: message() }
        }
        _ => ChargeOutcome::GatewayError {
            reason: format!("unexpected gateway status {}", status),
        },
    }
}

/// Таймаут HTTP-запроса строго меньше таймаута попытки в `PaymentProcessor`,
/// иначе зависший запрос не доходит до `record_failure`.
pub(crate) fn request_timeout(attempt_timeout: Duration) -> Duration {
    attempt_timeout
        .saturating_sub(attempt_timeout / 10)
        .max(Duration::from_millis(100))
}

fn request_token(amount: i64, currency: &str, order_id: &str, password: &str, team_slug: &str) -> String {
    let token_string = format!("{}{}{}{}{}", amount, currency, order_id, password, team_slug);
    let mut hasher = Sha256::new();
    hasher.update(token_string.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_timeout_fires_before_the_attempt_timeout() {
        assert_eq!(request_timeout(Duration::from_secs(10)), Duration::from_secs(9));
        assert!(request_timeout(Duration::from_secs(1)) < Duration::from_secs(1));
        assert_eq!(request_timeout(Duration::from_millis(50)), Duration::from_millis(100));
    }

    fn response(success: bool, status: &str, payment_id: Option<&str>) -> ChargeResponse {
        ChargeResponse {
            success,
            status: Some(status.to_string()),
            payment_id: payment_id.map(str::to_string),
            code: None,
            message: None,
        }
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, 60);
        for _ in 0..2 {
            breaker.record_failure();
        }
        assert_eq!(breaker.get_state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn breaker_half_opens_after_timeout_and_recovers() {
        let breaker = CircuitBreaker::new(1, 0);
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);

        assert!(breaker.can_execute());
        assert_eq!(breaker.get_state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.get_state(), CircuitState::Closed);
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, 0);
        breaker.record_failure();
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);
    }

    #[test]
    fn statuses_map_to_outcomes() {
        assert_eq!(
            interpret(response(true, "CONFIRMED", Some("tx-1"))),
            ChargeOutcome::Succeeded {
                transaction_id: "tx-1".to_string()
            }
        );
        assert!(matches!(
            interpret(response(true, "REJECTED", None)),
            ChargeOutcome::Declined { .. }
        ));
        assert!(matches!(
            interpret(response(false, "NEW", None)),
            ChargeOutcome::Declined { .. }
        ));
        assert!(matches!(
            interpret(response(true, "NEW", Some("tx-2"))),
            ChargeOutcome::GatewayError { .. }
        ));
    }

    #[test]
    fn token_depends_on_every_field() {
        let base = request_token(1000, "KZT", "order-1", "secret", "team");
        assert_eq!(base.len(), 64);
        assert_ne!(base, request_token(1001, "KZT", "order-1", "secret", "team"));
        assert_ne!(base, request_token(1000, "KZT", "order-2", "secret", "team"));
    }
}
