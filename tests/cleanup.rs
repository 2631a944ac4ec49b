mod common;

use chrono::Duration;
use std::time::Duration as StdDuration;
use tokio::sync::watch;

use common::{harness, seats};
use seat_engine::clock::Clock;
use seat_engine::gateway::ScriptedGateway;
use seat_engine::models::{
    ActiveAttempt, AttemptId, BookingId, BookingStatus, PaymentAttempt, PaymentAttemptStatus,
    UserId,
};
use seat_engine::services::{CleanupStats, LockMode};
use seat_engine::store::BookingStore;

#[tokio::test]
async fn sweep_reclaims_expired_reservations() {
    let h = harness(LockMode::Partitioned, ScriptedGateway::always_succeed());
    let screening = h.open_screening(1, 1, 4, 100).await;

    let stale = h
        .engine
        .bookings
        .create_booking(UserId(1), screening, &seats(&["A1", "A2"]))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(6));
    let fresh = h
        .engine
        .bookings
        .create_booking(UserId(2), screening, &seats(&["A3"]))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(5));

    let stats = h.engine.cleanup.run_full_cleanup().await;
    assert_eq!(
        stats,
        CleanupStats {
            expired_bookings: 1,
            abandoned_attempts: 0,
            orphaned_holds: 0,
        }
    );

    let stale = h.engine.bookings.get_booking(stale.id).await.unwrap();
    assert_eq!(stale.status, BookingStatus::Failed);
    assert!(h.seat_state(screening, "A1").await.is_free());
    assert!(h.seat_state(screening, "A2").await.is_free());
    assert_eq!(h.seat_state(screening, "A3").await.holder(), Some(fresh.id));

    // Повторный проход ничего не находит
    assert!(h.engine.cleanup.run_full_cleanup().await.is_empty());
}

/// Делает вид, что процесс упал посреди оплаты: попытка записана, ответа нет.
async fn pin_with_attempt(h: &common::Harness, booking_id: BookingId) -> AttemptId {
    let mut booking = h.store.load_booking(booking_id).await.unwrap().unwrap();
    let expected = booking.version;
    let now = h.clock.now();
    let attempt_id = AttemptId::for_booking(booking_id, 1);

    booking.attempts = 1;
    booking.active_attempt = Some(ActiveAttempt {
        attempt_id: attempt_id.clone(),
        started_at: now,
    });
    booking.version += 1;
    assert!(h.store.swap_booking(&booking, expected).await.unwrap());

    let mut attempt = PaymentAttempt::initiated(booking_id, 1, booking.total_amount, now);
    attempt.advance(PaymentAttemptStatus::AwaitingGateway, now).unwrap();
    h.store.save_attempt(&attempt).await.unwrap();
    attempt_id
}

#[tokio::test]
async fn in_flight_payment_pins_the_booking_until_the_deadline() {
    let h = harness(LockMode::Partitioned, ScriptedGateway::always_succeed());
    let screening = h.open_screening(2, 1, 2, 100).await;
    let booking = h
        .engine
        .bookings
        .create_booking(UserId(1), screening, &seats(&["A1"]))
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(9));
    pin_with_attempt(&h, booking.id).await;

    // Бронь просрочена, но оплата идёт меньше payment_deadline
    h.clock.advance(Duration::minutes(2) - Duration::seconds(1));
    assert!(h.engine.cleanup.run_full_cleanup().await.is_empty());
    assert_eq!(
        h.engine.bookings.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Pending
    );

    let err = h
        .engine
        .bookings
        .cancel_booking(booking.id, UserId(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn abandoned_attempt_is_reclaimed_after_the_deadline() {
    let h = harness(LockMode::Partitioned, ScriptedGateway::always_succeed());
    let screening = h.open_screening(3, 1, 2, 100).await;
    let booking = h
        .engine
        .bookings
        .create_booking(UserId(1), screening, &seats(&["A1", "A2"]))
        .await
        .unwrap();

    let attempt_id = pin_with_attempt(&h, booking.id).await;
    h.clock.advance(Duration::minutes(3));

    let stats = h.engine.cleanup.run_full_cleanup().await;
    assert_eq!(stats.abandoned_attempts, 1);
    assert_eq!(stats.expired_bookings, 0);

    let stored = h.engine.bookings.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Failed);
    assert!(stored.active_attempt.is_none());
    assert_eq!(h.ledger(screening).await.availability().free, 2);

    let attempts = h.engine.bookings.attempts(booking.id).await.unwrap();
    let attempt = attempts.iter().find(|a| a.attempt_id == attempt_id).unwrap();
    assert_eq!(attempt.status, PaymentAttemptStatus::GatewayError);
}

#[tokio::test]
async fn orphaned_holds_are_released_once_expired() {
    let h = harness(LockMode::Partitioned, ScriptedGateway::always_succeed());
    let screening = h.open_screening(4, 1, 3, 100).await;

    // Резерв без записи брони: процесс упал между reserve и insert
    let ghost = BookingId::new();
    h.engine
        .inventory
        .reserve(screening, &seats(&["A1", "A2"]), ghost)
        .await
        .unwrap();

    assert!(h.engine.cleanup.run_full_cleanup().await.is_empty());
    assert_eq!(h.seat_state(screening, "A1").await.holder(), Some(ghost));

    h.clock.advance(Duration::minutes(11));
    let stats = h.engine.cleanup.run_full_cleanup().await;
    assert_eq!(stats.orphaned_holds, 2);
    assert_eq!(h.ledger(screening).await.availability().free, 3);
}

#[tokio::test]
async fn holds_of_terminal_bookings_are_released() {
    let h = harness(LockMode::Partitioned, ScriptedGateway::always_succeed());
    let screening = h.open_screening(5, 1, 2, 100).await;
    let booking = h
        .engine
        .bookings
        .create_booking(UserId(1), screening, &seats(&["A1"]))
        .await
        .unwrap();

    // Бронь отменена, а до освобождения мест дело не дошло
    let mut stored = h.store.load_booking(booking.id).await.unwrap().unwrap();
    let expected = stored.version;
    stored.status = BookingStatus::Cancelled;
    stored.version += 1;
    assert!(h.store.swap_booking(&stored, expected).await.unwrap());

    let stats = h.engine.cleanup.run_full_cleanup().await;
    assert_eq!(stats.orphaned_holds, 1);
    assert!(h.seat_state(screening, "A1").await.is_free());
}

#[tokio::test]
async fn confirmed_seats_survive_the_sweep() {
    let h = harness(LockMode::Partitioned, ScriptedGateway::always_succeed());
    let screening = h.open_screening(6, 1, 2, 100).await;
    let booking = h
        .engine
        .bookings
        .create_booking(UserId(1), screening, &seats(&["A1"]))
        .await
        .unwrap();
    h.engine
        .bookings
        .process_payment(booking.id, &seat_engine::models::PaymentDetails::new("tok"))
        .await
        .unwrap();

    h.clock.advance(Duration::hours(2));
    assert!(h.engine.cleanup.run_full_cleanup().await.is_empty());
    assert_eq!(h.ledger(screening).await.availability().booked, 1);
}

#[tokio::test]
async fn loop_stops_on_shutdown_signal() {
    let h = harness(LockMode::Partitioned, ScriptedGateway::always_succeed());
    let cleanup = h.engine.cleanup.clone();
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { cleanup.run(StdDuration::from_millis(10), rx).await });
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(StdDuration::from_secs(1), handle)
        .await
        .expect("loop stops promptly")
        .unwrap();
}
