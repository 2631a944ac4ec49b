//! booking.rs
//!
//! Оркестратор бронирования: резерв мест -> запись брони -> оплата -> подтверждение или откат.
//!
//! Состояния брони: `Pending -> {Confirmed | Failed | Cancelled}`, терминальные состояния не
//! меняются. Запись брони делается через CAS по `Booking.version`. Пока попытка оплаты ждёт
//! шлюз (`active_attempt`), бронь закреплена: отмена и фоновая очистка её не трогают до
//! `payment_deadline`.
//!
//! Сначала бронь становится терминальной, потом освобождаются места. Если освободить места
//! не удалось за `release_attempts` попыток, вызывающий всё равно получает настоящий исход
//! (отмену, отказ, просрочку), а места забирает проход очистки по осиротевшим броням.

use chrono::Duration;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};

use super::inventory::SeatInventory;
use super::locking::backoff_delay;
use super::payment::PaymentProcessor;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::models::{
    ActiveAttempt, AttemptId, Booking, BookingId, BookingStatus, PaymentAttempt,
    PaymentAttemptStatus, PaymentDetails, ScreeningId, SeatId, UserId,
};
use crate::store::{BookingStore, ScreeningCatalog};

#[derive(Debug, Clone)]
pub struct BookingSettings {
    /// Сколько раз пробуем CAS записи брони.
    pub booking_cas_attempts: u32,
    /// Сколько ждём ответа по начатой оплате, прежде чем считать попытку брошенной.
    pub payment_deadline: Duration,
    /// Попытки освободить места брони, которая уже стала терминальной.
    pub release_attempts: u32,
    pub release_backoff: StdDuration,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            booking_cas_attempts: 5,
            payment_deadline: Duration::minutes(2),
            release_attempts: 3,
            release_backoff: StdDuration::from_millis(5),
        }
    }
}

pub struct BookingService {
    inventory: Arc<SeatInventory>,
    bookings: Arc<dyn BookingStore>,
    catalog: Arc<dyn ScreeningCatalog>,
    payments: PaymentProcessor,
    clock: Arc<dyn Clock>,
    settings: BookingSettings,
}

impl BookingService {
    pub fn new(
        inventory: Arc<SeatInventory>,
        bookings: Arc<dyn BookingStore>,
        catalog: Arc<dyn ScreeningCatalog>,
        payments: PaymentProcessor,
        clock: Arc<dyn Clock>,
        settings: BookingSettings,
    ) -> Self {
        Self {
            inventory,
            bookings,
            catalog,
            payments,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &BookingSettings {
        &self.settings
    }

    /// Резервирует места и создаёт бронь в статусе `Pending`.
    pub async fn create_booking(
        &self,
        user_id: UserId,
        screening_id: ScreeningId,
        seat_ids: &[SeatId],
    ) -> Result<Booking, EngineError> {
        if seat_ids.is_empty() {
            return Err(EngineError::InvalidRequest("no seats requested".to_string()));
        }

        let screening = self
            .catalog
            .screening(screening_id)
            .await?
            .ok_or(EngineError::ScreeningNotFound(screening_id))?;

        let booking_id = BookingId::new();
        let token = self.inventory.reserve(screening_id, seat_ids, booking_id).await?;

        let booking = Booking::pending(
            booking_id,
            user_id,
            screening_id,
            token.seats.clone(),
            screening.price,
            token.expires_at,
            self.clock.now(),
        );

        if let Err(e) = self.bookings.insert_booking(&booking).await {
            error!(
                booking_id = %booking_id,
                screening_id = %screening_id,
                error = %e,
                "Failed to persist booking, releasing hold"
            );
            if let Err(release_err) = self.inventory.release(screening_id, &token.seats, booking_id).await {
                warn!(
                    booking_id = %booking_id,
                    error = %release_err,
                    "Hold left for the sweep after failed booking insert"
                );
            }
            return Err(e.into());
        }

        info!(
            booking_id = %booking.id,
            user_id = %user_id,
            screening_id = %screening_id,
            seats = booking.seats.len(),
            total = booking.total_amount,
            "🎫 Booking created"
        );
        Ok(booking)
    }

    /// Проводит оплату брони и по итогу подтверждает или откатывает её.
    pub async fn process_payment(
        &self,
        booking_id: BookingId,
        details: &PaymentDetails,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let claimed = self
            .update_booking(booking_id, |b| {
                if b.status != BookingStatus::Pending {
                    return Err(EngineError::invalid_state(
                        b.status.as_str(),
                        "booking is not awaiting payment",
                    ));
                }
                if b.active_attempt.is_some() {
                    return Err(EngineError::invalid_state(
                        b.status.as_str(),
                        "payment already in progress",
                    ));
                }
                if b.is_expired(now) {
                    return Err(EngineError::ReservationExpired { booking_id });
                }
                b.attempts += 1;
                b.active_attempt = Some(ActiveAttempt {
                    attempt_id: AttemptId::for_booking(b.id, b.attempts),
                    started_at: now,
                });
                Ok(())
            })
            .await;

        let booking = match claimed {
            Ok(booking) => booking,
            Err(EngineError::ReservationExpired { .. }) => {
                self.expire_booking(booking_id).await?;
                info!(booking_id = %booking_id, "⏰ Payment refused, reservation expired");
                return Err(EngineError::ReservationExpired { booking_id });
            }
            Err(e) => return Err(e),
        };

        let attempt = match self.payments.execute(&booking, booking.attempts, details).await {
            Ok(attempt) => attempt,
            Err(e) => {
                self.settle_failure(&booking, &e.to_string()).await;
                return Err(e);
            }
        };

        if attempt.status == PaymentAttemptStatus::Succeeded {
            return self.finalize_success(booking, attempt).await;
        }

        let reason = attempt
            .last_error
            .clone()
            .unwrap_or_else(|| "payment was not completed".to_string());
        self.settle_failure(&booking, &reason).await;
        Err(EngineError::PaymentDeclined { reason })
    }

    /// Отмена пользователем до завершения оплаты.
    pub async fn cancel_booking(&self, booking_id: BookingId, user_id: UserId) -> Result<Booking, EngineError> {
        let booking = self
            .update_booking(booking_id, |b| {
                if b.user_id != user_id {
                    return Err(EngineError::NotOwner(booking_id));
                }
                if b.status.is_terminal() {
                    return Err(EngineError::invalid_state(b.status.as_str(), "booking is already final"));
                }
                if b.active_attempt.is_some() {
                    return Err(EngineError::invalid_state(b.status.as_str(), "payment in progress"));
                }
                transition(b, BookingStatus::Cancelled)
            })
            .await?;

        let freed = self.release_final(&booking).await;
        info!(booking_id = %booking_id, user_id = %user_id, seats = freed, "🚫 Booking cancelled");
        Ok(booking)
    }

    /// Переводит просроченную бронь в `Failed` и освобождает места.
    ///
    /// Просроченной считается бронь без активной оплаты после `reservation_expiry`, либо бронь,
    /// чья оплата висит дольше `payment_deadline`. Для остальных возвращает `None`.
    pub async fn expire_booking(&self, booking_id: BookingId) -> Result<Option<Booking>, EngineError> {
        let now = self.clock.now();
        let deadline = self.settings.payment_deadline;
        let mut reclaimed: Option<Option<AttemptId>> = None;

        let booking = self
            .update_booking(booking_id, |b| {
                reclaimed = None;
                if b.status != BookingStatus::Pending {
                    return Ok(());
                }
                match &b.active_attempt {
                    Some(active) if now - active.started_at > deadline => {
                        reclaimed = Some(Some(active.attempt_id.clone()));
                        b.failure_reason = Some("payment attempt abandoned".to_string());
                    }
                    Some(_) => return Ok(()),
                    None if b.is_expired(now) => {
                        reclaimed = Some(None);
                        b.failure_reason = Some("reservation expired".to_string());
                    }
                    None => return Ok(()),
                }
                b.active_attempt = None;
                transition(b, BookingStatus::Failed)
            })
            .await?;

        let Some(abandoned) = reclaimed else {
            return Ok(None);
        };
        if let Some(attempt_id) = abandoned {
            self.abandon_attempt(booking_id, &attempt_id).await;
        }

        let freed = self.release_final(&booking).await;
        info!(
            booking_id = %booking_id,
            screening_id = %booking.screening_id,
            seats = freed,
            reason = booking.failure_reason.as_deref().unwrap_or(""),
            "⏰ Booking expired"
        );
        Ok(Some(booking))
    }

    pub async fn get_booking(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        self.bookings
            .load_booking(booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))
    }

    pub async fn attempts(&self, booking_id: BookingId) -> Result<Vec<PaymentAttempt>, EngineError> {
        Ok(self.bookings.attempts_for(booking_id).await?)
    }

    async fn finalize_success(&self, booking: Booking, attempt: PaymentAttempt) -> Result<Booking, EngineError> {
        let booking_id = booking.id;

        if let Err(e) = self
            .inventory
            .confirm(booking.screening_id, &booking.seats, booking_id)
            .await
        {
            let reason = format!(
                "payment {} captured but seats could not be booked: {}",
                attempt.transaction_id.as_deref().unwrap_or("?"),
                e
            );
            return Err(self.escalate(&booking, reason).await);
        }

        let confirmed = self
            .update_booking(booking_id, |b| {
                if b.status != BookingStatus::Pending {
                    return Err(EngineError::invalid_state(
                        b.status.as_str(),
                        "booking left pending while payment was captured",
                    ));
                }
                b.active_attempt = None;
                b.failure_reason = None;
                transition(b, BookingStatus::Confirmed)
            })
            .await;

        match confirmed {
            Ok(booking) => {
                info!(
                    booking_id = %booking_id,
                    attempt_id = %attempt.attempt_id,
                    total = booking.total_amount,
                    "✅ Booking confirmed"
                );
                Ok(booking)
            }
            Err(e) => {
                let reason = format!(
                    "payment {} captured but booking could not be confirmed: {}",
                    attempt.transaction_id.as_deref().unwrap_or("?"),
                    e
                );
                Err(self.escalate(&booking, reason).await)
            }
        }
    }

    /// Деньги списаны, а места не закреплены. Бронь уходит в `Failed`, места освобождаются,
    /// ошибка возвращается вызывающему.
    async fn escalate(&self, booking: &Booking, reason: String) -> EngineError {
        error!(
            booking_id = %booking.id,
            screening_id = %booking.screening_id,
            reason = %reason,
            "🚨 Integrity violation, manual refund required"
        );

        let marked = self
            .update_booking(booking.id, |b| {
                if b.status != BookingStatus::Pending {
                    return Ok(());
                }
                b.active_attempt = None;
                b.failure_reason = Some(reason.clone());
                transition(b, BookingStatus::Failed)
            })
            .await;
        match marked {
            Ok(failed) if failed.status.is_terminal() => {
                self.release_final(&failed).await;
            }
            Ok(_) => {}
            Err(e) => warn!(booking_id = %booking.id, error = %e, "Could not mark booking as failed"),
        }

        EngineError::IntegrityViolation {
            booking_id: booking.id,
            reason,
        }
    }

    /// Отказ или исчерпанные повторы: бронь в `Failed`, места освобождаются.
    ///
    /// Если бронь не удалось перевести в `Failed`, она остаётся `Pending` с активной
    /// попыткой, и её заберёт очистка после `payment_deadline`.
    async fn settle_failure(&self, booking: &Booking, reason: &str) {
        let failed = self
            .update_booking(booking.id, |b| {
                if b.status != BookingStatus::Pending {
                    return Ok(());
                }
                b.active_attempt = None;
                b.failure_reason = Some(reason.to_string());
                transition(b, BookingStatus::Failed)
            })
            .await;

        match failed {
            Ok(failed) if failed.status == BookingStatus::Failed => {
                let freed = self.release_final(&failed).await;
                info!(booking_id = %booking.id, reason = %reason, seats = freed, "❌ Booking failed");
            }
            Ok(other) => debug!(
                booking_id = %booking.id,
                status = %other.status,
                "Booking already settled elsewhere"
            ),
            Err(e) => error!(
                booking_id = %booking.id,
                error = %e,
                "Could not mark booking as failed, leaving it to the sweep"
            ),
        }
    }

    /// Освобождает места терминальной брони. Возвращает число освобождённых мест;
    /// после исчерпания попыток ошибка только логируется.
    async fn release_final(&self, booking: &Booking) -> usize {
        let attempts = self.settings.release_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .inventory
                .release(booking.screening_id, &booking.seats, booking.id)
                .await
            {
                Ok(freed) => return freed.len(),
                Err(e) if attempt < attempts => {
                    debug!(booking_id = %booking.id, attempt, error = %e, "Seat release failed, retrying");
                    tokio::time::sleep(backoff_delay(self.settings.release_backoff, attempt)).await;
                }
                Err(e) => error!(
                    booking_id = %booking.id,
                    screening_id = %booking.screening_id,
                    status = %booking.status,
                    error = %e,
                    "Seats left held for the sweep"
                ),
            }
        }
        0
    }

    async fn abandon_attempt(&self, booking_id: BookingId, attempt_id: &AttemptId) {
        let attempts = match self.bookings.attempts_for(booking_id).await {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(booking_id = %booking_id, error = %e, "Could not load payment attempts");
                return;
            }
        };
        let Some(mut attempt) = attempts.into_iter().find(|a| a.attempt_id == *attempt_id) else {
            debug!(attempt_id = %attempt_id, "Abandoned attempt was never persisted");
            return;
        };
        if attempt.status.is_terminal() || attempt.status == PaymentAttemptStatus::GatewayError {
            return;
        }

        let now = self.clock.now();
        if attempt.status == PaymentAttemptStatus::Initiated {
            attempt.status = PaymentAttemptStatus::AwaitingGateway;
        }
        attempt.last_error = Some("no gateway outcome before payment deadline".to_string());
        if let Err(e) = attempt.advance(PaymentAttemptStatus::GatewayError, now) {
            warn!(attempt_id = %attempt_id, error = %e, "Could not close abandoned attempt");
            return;
        }
        if let Err(e) = self.bookings.save_attempt(&attempt).await {
            warn!(attempt_id = %attempt_id, error = %e, "Could not persist abandoned attempt");
        }
        warn!(booking_id = %booking_id, attempt_id = %attempt_id, "Payment attempt abandoned");
    }

    /// Читает бронь, применяет `f` и пишет результат через CAS по версии.
    /// Если `f` ничего не изменила, запись пропускается.
    async fn update_booking<F>(&self, booking_id: BookingId, mut f: F) -> Result<Booking, EngineError>
    where
        F: FnMut(&mut Booking) -> Result<(), EngineError> + Send,
    {
        let max_attempts = self.settings.booking_cas_attempts.max(1);

        for attempt in 1..=max_attempts {
            let current = self
                .bookings
                .load_booking(booking_id)
                .await?
                .ok_or(EngineError::NotFound(booking_id))?;

            let mut next = current.clone();
            f(&mut next)?;
            if next == current {
                return Ok(current);
            }

            next.version = current.version + 1;
            next.updated_at = self.clock.now();
            if self.bookings.swap_booking(&next, current.version).await? {
                return Ok(next);
            }
            debug!(booking_id = %booking_id, attempt, "Booking version conflict, retrying");
        }

        warn!(booking_id = %booking_id, "Booking CAS retry budget exhausted");
        Err(EngineError::ConcurrencyConflict)
    }
}

fn transition(booking: &mut Booking, next: BookingStatus) -> Result<(), EngineError> {
    if !booking.status.can_transition_to(next) {
        return Err(EngineError::invalid_state(
            booking.status.as_str(),
            format!("cannot move to {}", next),
        ));
    }
    booking.status = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_guards_terminal_states() {
        let now = chrono::Utc::now();
        let mut booking = Booking::pending(
            BookingId::new(),
            UserId(3),
            ScreeningId(1),
            [SeatId::new("A1")].into_iter().collect(),
            100,
            now,
            now,
        );
        transition(&mut booking, BookingStatus::Cancelled).unwrap();
        let err = transition(&mut booking, BookingStatus::Confirmed).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(booking.status, BookingStatus::Cancelled);
    }
}
