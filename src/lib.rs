pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod models;
pub mod redis_client;
pub mod services;
pub mod store;

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::EngineError;
use crate::gateway::{HttpPaymentGateway, PaymentGateway, ScriptedGateway};
use crate::services::{
    BookingService, CleanupService, ConcurrencyController, LockMode,
    PaymentProcessor, SeatInventory,
};
use crate::store::{BookingStore, LedgerStore, MemoryStore, PgStore, ScreeningCatalog};

/// Внешние зависимости движка: хранилища, шлюз и часы.
#[derive(Clone)]
pub struct EngineParts {
    pub ledgers: Arc<dyn LedgerStore>,
    pub bookings: Arc<dyn BookingStore>,
    pub catalog: Arc<dyn ScreeningCatalog>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub clock: Arc<dyn Clock>,
}

impl EngineParts {
    /// Все три хранилища в одном `MemoryStore`.
    pub fn in_memory(store: Arc<MemoryStore>, gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledgers: store.clone(),
            bookings: store.clone(),
            catalog: store,
            gateway,
            clock,
        }
    }
}

/// Собранный движок бронирования.
#[derive(Clone)]
pub struct Engine {
    pub controller: Arc<ConcurrencyController>,
    pub inventory: Arc<SeatInventory>,
    pub bookings: Arc<BookingService>,
    pub cleanup: Arc<CleanupService>,
}

impl Engine {
    pub fn assemble(
        parts: EngineParts,
        config: &Config,
        redis: Option<redis_client::RedisClient>,
    ) -> Result<Self, EngineError> {
        let booking = &config.booking;

        let controller = Arc::new(ConcurrencyController::from_mode(
            parts.ledgers.clone(),
            booking.lock_mode,
            booking.lock_settings(),
            redis,
        )?);
        let inventory = Arc::new(SeatInventory::new(
            parts.ledgers.clone(),
            controller.clone(),
            parts.clock.clone(),
            booking.hold_duration(),
        ));
        let payments = PaymentProcessor::new(
            parts.gateway,
            parts.bookings.clone(),
            parts.clock.clone(),
            config.payment.retry_policy(),
        );
        let bookings = Arc::new(BookingService::new(
            inventory.clone(),
            parts.bookings.clone(),
            parts.catalog,
            payments,
            parts.clock.clone(),
            booking.booking_settings(),
        ));
        let cleanup = Arc::new(CleanupService::new(
            bookings.clone(),
            inventory.clone(),
            parts.ledgers,
            parts.bookings,
            parts.clock,
        ));

        Ok(Self {
            controller,
            inventory,
            bookings,
            cleanup,
        })
    }
}

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub db: database::Database,
    pub redis: Option<redis_client::RedisClient>,
    pub config: Config,
    pub engine: Engine,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let db = database::Database::connect(&config.database)
            .await
            .context("Failed to connect to database")?;

        db.run_migrations().await.context("Failed to run migrations")?;

        let redis = if config.booking.lock_mode == LockMode::Distributed {
            let redis = redis_client::RedisClient::new(&config.redis.url)
                .await
                .context("Failed to connect to Redis")?;
            info!("Redis connected");
            Some(redis)
        } else {
            None
        };

        let gateway: Arc<dyn PaymentGateway> = if config.payment.use_mock {
            info!("Using scripted payment gateway");
            Arc::new(ScriptedGateway::always_succeed())
        } else {
            Arc::new(
                HttpPaymentGateway::from_config(&config.payment, &config.circuit_breaker)
                    .context("Failed to create HTTP client")?,
            )
        };

        let store = Arc::new(PgStore::new(db.clone()));
        let parts = EngineParts {
            ledgers: store.clone(),
            bookings: store.clone(),
            catalog: store,
            gateway,
            clock: Arc::new(SystemClock),
        };
        let engine = Engine::assemble(parts, &config, redis.clone()).context("Failed to assemble engine")?;

        Ok(Arc::new(Self {
            db,
            redis,
            config,
            engine,
        }))
    }
}
