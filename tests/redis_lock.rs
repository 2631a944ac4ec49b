//! Распределённая блокировка против настоящего Redis.
//! Тесты запускаются, только если задан `REDIS_URL`.

mod common;

use futures::future::join_all;
use std::time::Duration;
use uuid::Uuid;

use common::{harness_on, seats, test_config, Harness};
use seat_engine::error::EngineError;
use seat_engine::gateway::ScriptedGateway;
use seat_engine::models::{SeatId, UserId};
use seat_engine::redis_client::RedisClient;
use seat_engine::services::LockMode;

async fn redis() -> Option<RedisClient> {
    let url = std::env::var("REDIS_URL").ok()?;
    Some(RedisClient::new(&url).await.expect("redis is reachable"))
}

fn distributed(redis: RedisClient) -> Harness {
    let mut config = test_config(LockMode::Distributed);
    config.booking.lock_acquire_timeout_ms = 5000;
    harness_on(config, ScriptedGateway::always_succeed(), Some(redis))
}

/// Сеансы с уникальными id, чтобы параллельные прогоны не делили ключи блокировок.
fn fresh_screening_id() -> i64 {
    (Uuid::new_v4().as_u128() % 1_000_000_000) as i64 + 1
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distributed_lock_never_oversells() {
    let Some(redis) = redis().await else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let h = distributed(redis);
    let screening = h.open_screening(fresh_screening_id(), 1, 10, 100).await;

    let handles = (0..30).map(|i| {
        let bookings = h.engine.bookings.clone();
        let first = SeatId::from_position(0, (i % 10) as u32);
        let second = SeatId::from_position(0, ((i + 1) % 10) as u32);
        tokio::spawn(async move {
            bookings
                .create_booking(UserId(i as i64), screening, &[first, second])
                .await
        })
    });
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    let ledger = h.ledger(screening).await;
    assert!(ledger.within_capacity());
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert!((1..=5).contains(&winners));
    assert_eq!(ledger.availability().held as usize, winners * 2);
    assert_eq!(ledger.version, winners as u64);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, EngineError::SeatUnavailable { .. }), "unexpected error: {e:?}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distributed_lock_has_one_winner_for_the_same_seats() {
    let Some(redis) = redis().await else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let h = distributed(redis);
    let screening = h.open_screening(fresh_screening_id(), 1, 4, 100).await;

    let handles = (0..20).map(|i| {
        let bookings = h.engine.bookings.clone();
        tokio::spawn(async move {
            bookings
                .create_booking(UserId(i), screening, &seats(&["A2", "A3"]))
                .await
        })
    });
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(h.ledger(screening).await.availability().held, 2);
}

#[tokio::test]
async fn unlock_leaves_someone_elses_lock_alone() {
    let Some(redis) = redis().await else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let key = format!("seat_engine:test:lock:{}", Uuid::new_v4());

    assert!(redis.try_lock(&key, "owner", 5_000).await.unwrap());
    assert!(!redis.try_lock(&key, "intruder", 5_000).await.unwrap());
    assert!(!redis.unlock(&key, "intruder").await.unwrap());

    // Ключ всё ещё у владельца
    assert!(!redis.try_lock(&key, "intruder", 5_000).await.unwrap());
    assert!(redis.unlock(&key, "owner").await.unwrap());
    assert!(redis.try_lock(&key, "intruder", 5_000).await.unwrap());
    assert!(redis.unlock(&key, "intruder").await.unwrap());
}

#[tokio::test]
async fn expired_lock_can_be_taken_over() {
    let Some(redis) = redis().await else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let key = format!("seat_engine:test:lock:{}", Uuid::new_v4());

    assert!(redis.try_lock(&key, "slow", 50).await.unwrap());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(redis.try_lock(&key, "fast", 5_000).await.unwrap());
    // Опоздавший владелец не снимает чужую блокировку
    assert!(!redis.unlock(&key, "slow").await.unwrap());
    assert!(redis.unlock(&key, "fast").await.unwrap());
}
