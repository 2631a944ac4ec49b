use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{ChargeOutcome, PaymentGateway};
use crate::models::{AttemptId, PaymentDetails};

/// Поведение шлюза на очередной вызов.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStep {
    Succeed,
    Decline(String),
    Error(String),
    /// Не отвечает, пока вызывающий не отвалится по таймауту.
    Hang,
    /// Деньги списаны, но ответ потерян по дороге.
    LoseResponse,
}

/// Шлюз со сценарием ответов для тестов и локального запуска.
///
/// Идемпотентен по ключу: после успешного списания повтор с тем же ключом возвращает ту же
/// транзакцию и не увеличивает `charge_count()`.
#[derive(Debug)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<GatewayStep>>,
    fallback: GatewayStep,
    settled: Mutex<HashMap<AttemptId, String>>,
    calls: Mutex<Vec<AttemptId>>,
    charges: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(steps: impl IntoIterator<Item = GatewayStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            fallback: GatewayStep::Succeed,
            settled: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            charges: AtomicUsize::new(0),
        }
    }

    pub fn always_succeed() -> Self {
        Self::new([])
    }

    /// Ответ, когда сценарий закончился.
    pub fn with_fallback(mut self, step: GatewayStep) -> Self {
        self.fallback = step;
        self
    }

    /// Сколько раз деньги реально списывались.
    pub fn charge_count(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    /// Все ключи, с которыми вызывался `charge`, по порядку.
    pub fn calls(&self) -> Vec<AttemptId> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn settle(&self, key: &AttemptId) -> String {
        let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        let transaction_id = format!("mock-tx-{}", n);
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), transaction_id.clone());
        transaction_id
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn charge(&self, key: &AttemptId, amount_minor: i64, _details: &PaymentDetails) -> ChargeOutcome {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());

        let replay = self
            .settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        if let Some(transaction_id) = replay {
            debug!(attempt_id = %key, "Replaying settled charge");
            return ChargeOutcome::Succeeded { transaction_id };
        }

        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        debug!(attempt_id = %key, amount = amount_minor, step = ?step, "Scripted charge");

        match step {
            GatewayStep::Succeed => ChargeOutcome::Succeeded {
                transaction_id: self.settle(key),
            },
            GatewayStep::Decline(reason) => ChargeOutcome::Declined { reason },
            GatewayStep::Error(reason) => ChargeOutcome::GatewayError { reason },
            GatewayStep::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ChargeOutcome::GatewayError {
                    reason: "gateway hung".to_string(),
                }
            }
            GatewayStep::LoseResponse => {
                self.settle(key);
                ChargeOutcome::GatewayError {
                    reason: "connection reset before response".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookingId;

    #[tokio::test]
    async fn settled_keys_are_replayed_without_recharging() {
        let gateway = ScriptedGateway::new([GatewayStep::LoseResponse]);
        let key = AttemptId::for_booking(BookingId::new(), 1);
        let details = PaymentDetails::new("tok");

        let first = gateway.charge(&key, 500, &details).await;
        assert!(matches!(first, ChargeOutcome::GatewayError { .. }));

        let second = gateway.charge(&key, 500, &details).await;
        assert!(matches!(second, ChargeOutcome::Succeeded { .. }));
        assert_eq!(gateway.charge_count(), 1);
        assert_eq!(gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn fallback_applies_after_script() {
        let gateway = ScriptedGateway::new([GatewayStep::Succeed])
            .with_fallback(GatewayStep::Decline("insufficient funds".into()));
        let details = PaymentDetails::new("tok");
        let booking = BookingId::new();

        let first = gateway.charge(&AttemptId::for_booking(booking, 1), 1, &details).await;
        let second = gateway.charge(&AttemptId::for_booking(booking, 2), 1, &details).await;
        assert!(matches!(first, ChargeOutcome::Succeeded { .. }));
        assert!(matches!(second, ChargeOutcome::Declined { .. }));
    }
}
