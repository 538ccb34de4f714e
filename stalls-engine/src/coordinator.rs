use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use stalls_core::{LockError, ScopedLock, SeatKey, SeatLocks};

/// Locks held over a seat set, in acquisition order.
///
/// Dropping an unreleased set releases every lock through the backend's own
/// drop behaviour.
pub struct LockSet {
    locks: Vec<ScopedLock>,
}

impl LockSet {
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn seat_keys(&self) -> Vec<SeatKey> {
        self.locks.iter().map(|l| l.seat_key().clone()).collect()
    }

    /// Releases in reverse acquisition order. Calling it again is a no-op.
    pub async fn release_all(&mut self) {
        while let Some(lock) = self.locks.pop() {
            lock.unlock().await;
        }
    }
}

/// Locks a multi-seat claim without deadlock.
///
/// Seats are always locked in canonical (`Ord`) order and released in
/// reverse, so two claimants with overlapping seat sets never wait on each
/// other in a cycle.
#[derive(Clone)]
pub struct LockCoordinator {
    locks: Arc<dyn SeatLocks>,
    max_wait: Duration,
}

impl LockCoordinator {
    pub fn new(locks: Arc<dyn SeatLocks>, max_wait: Duration) -> Self {
        Self { locks, max_wait }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Locks every seat in canonical order, waiting at most `max_wait` in total.
    ///
    /// On timeout or backend failure the locks acquired so far are released
    /// before the error is returned.
    pub async fn acquire_all(&self, seat_keys: &[SeatKey]) -> Result<LockSet, LockError> {
        let mut ordered: Vec<&SeatKey> = seat_keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let deadline = Instant::now() + self.max_wait;
        let mut set = LockSet {
            locks: Vec::with_capacity(ordered.len()),
        };

        for key in ordered {
            match self.locks.lock(key, deadline).await {
                Ok(lock) => set.locks.push(lock),
                Err(err) => {
                    warn!(
                        seat = %key,
                        acquired = set.len(),
                        error = %err,
                        "Lock acquisition failed, releasing partial set"
                    );
                    set.release_all().await;
                    return Err(err);
                }
            }
        }

        debug!(seats = set.len(), "Acquired all seat locks");
        Ok(set)
    }

    pub async fn release_all(&self, set: &mut LockSet) {
        set.release_all().await;
    }
}
