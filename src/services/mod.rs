pub mod booking;
pub mod cleanup;
pub mod inventory;
pub mod locking;
pub mod payment;

pub use booking::{BookingService, BookingSettings};
pub use cleanup::{CleanupService, CleanupStats};
pub use inventory::{ReservationToken, ScreeningSnapshot, SeatInventory};
pub use locking::{ConcurrencyController, LockMode, LockSettings};
pub use payment::{PaymentProcessor, RetryPolicy};
