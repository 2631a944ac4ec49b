pub mod booking;
pub mod payment;
pub mod screening;
pub mod seat;

pub use booking::{ActiveAttempt, Booking, BookingId, BookingStatus, UserId};
pub use payment::{AttemptId, PaymentAttempt, PaymentAttemptStatus, PaymentDetails};
pub use screening::{Availability, LedgerEntry, Screening, ScreeningId};
pub use seat::{SeatId, SeatState};
