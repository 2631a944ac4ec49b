use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::booking::BookingService;
use super::inventory::SeatInventory;
use crate::clock::Clock;
use crate::models::ScreeningId;
use crate::store::{BookingStore, LedgerStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub expired_bookings: usize,
    pub abandoned_attempts: usize,
    /// Места, освобождённые у держателей без живой брони.
    pub orphaned_holds: usize,
}

impl CleanupStats {
    pub fn is_empty(&self) -> bool {
        self.expired_bookings == 0 && self.abandoned_attempts == 0 && self.orphaned_holds == 0
    }
}

pub struct CleanupService {
    bookings: Arc<BookingService>,
    inventory: Arc<SeatInventory>,
    ledgers: Arc<dyn LedgerStore>,
    booking_store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
}

impl CleanupService {
    pub fn new(
        bookings: Arc<BookingService>,
        inventory: Arc<SeatInventory>,
        ledgers: Arc<dyn LedgerStore>,
        booking_store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bookings,
            inventory,
            ledgers,
            booking_store,
            clock,
        }
    }

    /// Запускает полную очистку: просроченные брони, брошенные оплаты, висящие холды.
    pub async fn run_full_cleanup(&self) -> CleanupStats {
        debug!("🧹 Starting full cleanup process");
        let mut stats = CleanupStats::default();

        // Сначала брони: их освобождение снимает большую часть холдов
        self.cleanup_expired_bookings(&mut stats).await;

        // Затем холды, у которых держатель уже не жив
        self.cleanup_orphaned_holds(&mut stats).await;

        if stats.is_empty() {
            debug!("✅ Full cleanup process completed, nothing to reclaim");
        } else {
            info!(
                expired = stats.expired_bookings,
                abandoned = stats.abandoned_attempts,
                orphaned_seats = stats.orphaned_holds,
                "✅ Full cleanup process completed"
            );
        }
        stats
    }

    /// Крутит очистку с интервалом, пока не придёт сигнал остановки.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "🧹 Cleanup loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_full_cleanup().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🧹 Cleanup loop stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn cleanup_expired_bookings(&self, stats: &mut CleanupStats) {
        let pending = match self.booking_store.pending_bookings().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to list pending bookings");
                return;
            }
        };

        let now = self.clock.now();
        let deadline = self.bookings.settings().payment_deadline;

        for booking in pending {
            let abandoned = match &booking.active_attempt {
                Some(active) if now - active.started_at > deadline => true,
                Some(_) => continue,
                None if booking.is_expired(now) => false,
                None => continue,
            };

            match self.bookings.expire_booking(booking.id).await {
                Ok(Some(_)) if abandoned => stats.abandoned_attempts += 1,
                Ok(Some(_)) => stats.expired_bookings += 1,
                Ok(None) => {}
                Err(e) => warn!(booking_id = %booking.id, error = %e, "Failed to expire booking"),
            }
        }
    }

    async fn cleanup_orphaned_holds(&self, stats: &mut CleanupStats) {
        let screening_ids = match self.ledgers.screening_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list screenings");
                return;
            }
        };

        for screening_id in screening_ids {
            stats.orphaned_holds += self.cleanup_screening_holds(screening_id).await;
        }
    }

    async fn cleanup_screening_holds(&self, screening_id: ScreeningId) -> usize {
        let entry = match self.ledgers.load_ledger(screening_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return 0,
            Err(e) => {
                warn!(screening_id = %screening_id, error = %e, "Failed to load ledger");
                return 0;
            }
        };

        let now = self.clock.now();
        let mut freed = 0;

        for (holder, earliest_expiry) in entry.hold_owners() {
            let orphaned = match self.booking_store.load_booking(holder).await {
                // Бронь ещё не записана: холд свежий, это create_booking в процессе
                Ok(None) => now > earliest_expiry,
                Ok(Some(booking)) => booking.status.is_terminal(),
                Err(e) => {
                    warn!(booking_id = %holder, error = %e, "Failed to load hold owner");
                    false
                }
            };
            if !orphaned {
                continue;
            }

            match self.inventory.release_holder(screening_id, holder).await {
                Ok(seats) if !seats.is_empty() => {
                    warn!(
                        screening_id = %screening_id,
                        booking_id = %holder,
                        seats = seats.len(),
                        "🔓 Orphaned hold released"
                    );
                    freed += seats.len();
                }
                Ok(_) => {}
                Err(e) => warn!(
                    screening_id = %screening_id,
                    booking_id = %holder,
                    error = %e,
                    "Failed to release orphaned hold"
                ),
            }
        }
        freed
    }
}
