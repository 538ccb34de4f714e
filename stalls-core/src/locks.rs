use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::LockError;
use crate::model::SeatKey;

/// A held per-seat mutual-exclusion token.
///
/// Dropping a lock without calling `unlock` must still release it, so that a
/// cancelled caller never leaves a seat locked.
#[async_trait]
pub trait SeatLock: Send + Sync {
    fn seat_key(&self) -> &SeatKey;

    async fn unlock(self: Box<Self>);
}

pub type ScopedLock = Box<dyn SeatLock>;

/// Per-seat lock primitive backing the pessimistic strategy.
///
/// Locks carry no stored-state side effect; seat mutation still goes through
/// a version-checked `compare_and_set`.
#[async_trait]
pub trait SeatLocks: Send + Sync {
    /// Waits for the lock on `seat_key` until `deadline`.
    async fn lock(&self, seat_key: &SeatKey, deadline: Instant) -> Result<ScopedLock, LockError>;
}
