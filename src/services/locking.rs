//! locking.rs
//!
//! Координация изменений реестра мест одного сеанса.
//!
//! `ConcurrencyController::with_screening_lock` выполняет чистую функцию над `LedgerEntry`
//! под логической блокировкой сеанса. Режим блокировки выбирается конфигурацией:
//!
//! 1.  **Partitioned**: отдельный `tokio::sync::Mutex` на каждый сеанс в пределах процесса.
//! 2.  **Optimistic**: без блокировки, чтение версии, вычисление и CAS с повторами.
//! 3.  **Distributed**: блокировка в Redis (`SET NX PX`) на сеанс, общая для всех процессов.
//!
//! В любом режиме финальная запись делается через CAS по `version`, так что писатель в обход
//! контроллера не может быть молча перезаписан.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, StoreError};
use crate::models::{LedgerEntry, ScreeningId};
use crate::redis_client::RedisClient;
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    #[default]
    Partitioned,
    Optimistic,
    Distributed,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Сколько раз пробуем CAS, прежде чем вернуть `ConcurrencyConflict`.
    pub cas_max_attempts: u32,
    pub cas_base_backoff: Duration,
    /// TTL ключа блокировки в Redis.
    pub lock_ttl: Duration,
    pub lock_acquire_timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            cas_max_attempts: 5,
            cas_base_backoff: Duration::from_millis(5),
            lock_ttl: Duration::from_millis(2000),
            lock_acquire_timeout: Duration::from_millis(1000),
        }
    }
}

enum LockGuard {
    Local(ScreeningId, OwnedMutexGuard<()>),
    Remote { key: String, token: String },
    Unlocked,
}

pub struct ConcurrencyController {
    store: Arc<dyn LedgerStore>,
    mode: LockMode,
    settings: LockSettings,
    /// Мьютексы сеансов, у которых сейчас есть владелец или ожидающие.
    partitions: Mutex<HashMap<ScreeningId, Arc<AsyncMutex<()>>>>,
    redis: Option<RedisClient>,
}

impl ConcurrencyController {
    pub fn partitioned(store: Arc<dyn LedgerStore>, settings: LockSettings) -> Self {
        Self::build(store, LockMode::Partitioned, settings, None)
    }

    pub fn optimistic(store: Arc<dyn LedgerStore>, settings: LockSettings) -> Self {
        Self::build(store, LockMode::Optimistic, settings, None)
    }

    pub fn distributed(store: Arc<dyn LedgerStore>, redis: RedisClient, settings: LockSettings) -> Self {
        Self::build(store, LockMode::Distributed, settings, Some(redis))
    }

    /// Режим из конфигурации. Для `Distributed` нужен Redis.
    pub fn from_mode(
        store: Arc<dyn LedgerStore>,
        mode: LockMode,
        settings: LockSettings,
        redis: Option<RedisClient>,
    ) -> Result<Self, EngineError> {
        match (mode, redis) {
            (LockMode::Distributed, Some(redis)) => Ok(Self::distributed(store, redis, settings)),
            (LockMode::Distributed, None) => Err(EngineError::InvalidRequest(
                "distributed lock mode requires a redis connection".to_string(),
            )),
            (mode, _) => Ok(Self::build(store, mode, settings, None)),
        }
    }

    fn build(
        store: Arc<dyn LedgerStore>,
        mode: LockMode,
        settings: LockSettings,
        redis: Option<RedisClient>,
    ) -> Self {
        Self {
            store,
            mode,
            settings,
            partitions: Mutex::new(HashMap::new()),
            redis,
        }
    }

    /// Выполняет `f` над реестром сеанса с исключительным логическим владением.
    ///
    /// `f` должна быть чистой: при конфликте версий она вызывается повторно на свежем
    /// состоянии. Если `f` вернула ошибку, ничего не записывается. Если `f` ничего не
    /// изменила, запись и увеличение версии пропускаются.
    pub async fn with_screening_lock<T, F>(&self, screening_id: ScreeningId, f: F) -> Result<T, EngineError>
    where
        F: FnMut(&mut LedgerEntry) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let guard = self.acquire(screening_id).await?;
        let result = self.commit(screening_id, f).await;
        self.release(guard).await;
        result
    }

    async fn commit<T, F>(&self, screening_id: ScreeningId, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut(&mut LedgerEntry) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let max_attempts = self.settings.cas_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let current = self
                .store
                .load_ledger(screening_id)
                .await?
                .ok_or(EngineError::ScreeningNotFound(screening_id))?;

            let mut next = current.clone();
            let value = f(&mut next)?;

            if next.seat_states == current.seat_states {
                return Ok(value);
            }

            next.version = current.version + 1;
            if self.store.swap_ledger(&next, current.version).await? {
                debug!(
                    screening_id = %screening_id,
                    version = next.version,
                    "Ledger committed"
                );
                return Ok(value);
            }

            debug!(
                screening_id = %screening_id,
                attempt,
                expected_version = current.version,
                "Ledger version conflict, retrying"
            );
            if attempt < max_attempts {
                tokio::time::sleep(backoff_delay(self.settings.cas_base_backoff, attempt)).await;
            }
        }

        warn!(
            screening_id = %screening_id,
            attempts = max_attempts,
            "Ledger CAS retry budget exhausted"
        );
        Err(EngineError::ConcurrencyConflict)
    }

    async fn acquire(&self, screening_id: ScreeningId) -> Result<LockGuard, EngineError> {
        match self.mode {
            LockMode::Partitioned => {
                let partition = {
                    let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
                    partitions
                        .entry(screening_id)
                        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                        .clone()
                };
                Ok(LockGuard::Local(screening_id, partition.lock_owned().await))
            }
            LockMode::Optimistic => Ok(LockGuard::Unlocked),
            LockMode::Distributed => self.acquire_remote(screening_id).await,
        }
    }

    async fn acquire_remote(&self, screening_id: ScreeningId) -> Result<LockGuard, EngineError> {
        let redis = self.redis.as_ref().ok_or(EngineError::ConcurrencyConflict)?;
        let key = lock_key(screening_id);
        let token = Uuid::new_v4().to_string();
        let ttl_ms = self.settings.lock_ttl.as_millis() as u64;
        let deadline = Instant::now() + self.settings.lock_acquire_timeout;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if redis
                .try_lock(&key, &token, ttl_ms)
                .await
                .map_err(StoreError::from)?
            {
                return Ok(LockGuard::Remote { key, token });
            }
            if Instant::now() >= deadline {
                warn!(
                    screening_id = %screening_id,
                    attempts = attempt,
                    "Timed out waiting for distributed screening lock"
                );
                return Err(EngineError::ConcurrencyConflict);
            }
            tokio::time::sleep(backoff_delay(self.settings.cas_base_backoff, attempt)).await;
        }
    }

    async fn release(&self, guard: LockGuard) {
        match guard {
            LockGuard::Local(screening_id, guard) => {
                drop(guard);
                self.prune_partition(screening_id);
            }
            LockGuard::Unlocked => {}
            LockGuard::Remote { key, token } => {
                let Some(redis) = self.redis.as_ref() else {
                    return;
                };
                match redis.unlock(&key, &token).await {
                    Ok(true) => {}
                    Ok(false) => warn!(key = %key, "Distributed lock expired before release"),
                    Err(e) => warn!(key = %key, error = %e, "Failed to release distributed lock"),
                }
            }
        }
    }
}

impl ConcurrencyController {
    /// Убирает мьютекс сеанса, если на него больше никто не ссылается.
    /// Клоны `Arc` выдаются только под блокировкой карты, так что проверка счётчика здесь
    /// не гоняется с `acquire`.
    fn prune_partition(&self, screening_id: ScreeningId) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        if partitions
            .get(&screening_id)
            .is_some_and(|partition| Arc::strong_count(partition) == 1)
        {
            partitions.remove(&screening_id);
        }
    }

    #[cfg(test)]
    fn tracked_partitions(&self) -> usize {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn lock_key(screening_id: ScreeningId) -> String {
    format!("seat_engine:lock:screening:{}", screening_id)
}

/// Экспоненциальная задержка с джиттером: base * 2^(attempt-1) плюс до половины сверху.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(6));
    let exp_ms = exp.as_millis() as u64;
    let jitter = if exp_ms > 1 {
        rand::thread_rng().gen_range(0..=exp_ms / 2)
    } else {
        0
    };
    exp + Duration::from_millis(jitter)
}
