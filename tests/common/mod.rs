#![allow(dead_code)]

use std::sync::Arc;

use seat_engine::clock::ManualClock;
use seat_engine::config::Config;
use seat_engine::gateway::ScriptedGateway;
use seat_engine::models::{LedgerEntry, Screening, ScreeningId, SeatId, SeatState};
use seat_engine::redis_client::RedisClient;
use seat_engine::services::LockMode;
use seat_engine::store::{LedgerStore, MemoryStore};
use seat_engine::{Engine, EngineParts};

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
    pub engine: Engine,
}

/// Конфигурация с короткими задержками, чтобы тесты не спали.
pub fn test_config(mode: LockMode) -> Config {
    let mut config = Config::default();
    config.booking.lock_mode = mode;
    config.booking.cas_base_backoff_ms = 1;
    config.booking.cas_max_attempts = 50;
    config.payment.retry_base_delay_ms = 1;
    config.payment.retry_max_delay_ms = 4;
    config.payment.timeout_secs = 1;
    config
}

pub fn harness(mode: LockMode, gateway: ScriptedGateway) -> Harness {
    harness_with(test_config(mode), gateway)
}

pub fn harness_with(config: Config, gateway: ScriptedGateway) -> Harness {
    harness_on(config, gateway, None)
}

pub fn harness_on(config: Config, gateway: ScriptedGateway, redis: Option<RedisClient>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(gateway);
    let clock = Arc::new(ManualClock::default());
    let parts = EngineParts::in_memory(store.clone(), gateway.clone(), clock.clone());
    let engine = Engine::assemble(parts, &config, redis).expect("engine assembles");
    Harness {
        store,
        gateway,
        clock,
        engine,
    }
}

impl Harness {
    /// Регистрирует сеанс в каталоге и открывает реестр `rows x per_row`.
    pub async fn open_screening(&self, id: i64, rows: u32, per_row: u32, price: i64) -> ScreeningId {
        let screening = Screening {
            id: ScreeningId(id),
            capacity: rows * per_row,
            price,
        };
        self.store.add_screening(screening.clone()).await;
        let layout = LedgerEntry::grid(screening.id, rows, per_row);
        self.engine
            .inventory
            .open_screening(&screening, layout.seat_states.into_keys())
            .await
            .expect("screening opens");
        screening.id
    }

    pub async fn ledger(&self, id: ScreeningId) -> LedgerEntry {
        self.store
            .load_ledger(id)
            .await
            .expect("store is readable")
            .expect("ledger exists")
    }

    pub async fn seat_state(&self, id: ScreeningId, seat: &str) -> SeatState {
        *self
            .ledger(id)
            .await
            .state_of(&SeatId::new(seat))
            .expect("seat exists")
    }
}

pub fn seats(raw: &[&str]) -> Vec<SeatId> {
    raw.iter().map(|s| SeatId::new(*s)).collect()
}
