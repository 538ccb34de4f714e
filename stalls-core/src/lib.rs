pub mod clock;
pub mod error;
pub mod events;
pub mod locks;
pub mod model;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FinalizeError, LockError, ReservationError, StoreError, StoreResult};
pub use events::{EventPublisher, ReservationEvent};
pub use locks::{ScopedLock, SeatLock, SeatLocks};
pub use model::{
    Booking, BookingId, ClaimantId, Hold, HoldId, HoldState, Seat, SeatKey, SeatStatus,
    SeatTransition, ShowId,
};
pub use store::{HoldStore, SeatStore};

/// Locking strategy used by the reservation manager.
///
/// `ThreadLocal` exists only so configuration naming it can be parsed and
/// rejected: process-local lock maps are unsound once more than one
/// instance serves the same show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingStrategy {
    Pessimistic,
    Optimistic,
    ThreadLocal,
}

impl Default for LockingStrategy {
    fn default() -> Self {
        LockingStrategy::Pessimistic
    }
}
