use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::debug;

use stalls_core::{LockError, ScopedLock, SeatKey, SeatLock, SeatLocks};

type Slot = Arc<tokio::sync::Mutex<()>>;
type Table = Arc<Mutex<HashMap<SeatKey, Slot>>>;

/// In-process mutex table, one async mutex per seat.
///
/// Waiters on the same seat are woken in FIFO order. Only valid when a single
/// process serves the show. A seat's entry lives only while someone holds or
/// waits on it.
#[derive(Default)]
pub struct InMemorySeatLocks {
    table: Table,
}

impl InMemorySeatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seats currently held or waited on.
    pub fn tracked(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn slot(&self, seat_key: &SeatKey) -> Slot {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entry(seat_key.clone()).or_default().clone()
    }
}

/// Drops the table entry for `seat_key` if `ours` is its only user besides
/// the table. Checked under the table lock, so no new user can appear.
fn prune(table: &Table, seat_key: &SeatKey, ours: &Slot) {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    let idle = table
        .get(seat_key)
        .is_some_and(|slot| Arc::ptr_eq(slot, ours) && Arc::strong_count(ours) == 2);
    if idle {
        table.remove(seat_key);
    }
}

#[async_trait]
impl SeatLocks for InMemorySeatLocks {
    async fn lock(&self, seat_key: &SeatKey, deadline: Instant) -> Result<ScopedLock, LockError> {
        let slot = self.slot(seat_key);
        match tokio::time::timeout_at(deadline, slot.clone().lock_owned()).await {
            Ok(guard) => {
                debug!(seat = %seat_key, "Seat lock acquired");
                drop(slot);
                Ok(Box::new(MemoryLock {
                    table: self.table.clone(),
                    seat_key: seat_key.clone(),
                    guard: Some(guard),
                }))
            }
            Err(_) => {
                prune(&self.table, seat_key, &slot);
                Err(LockError::Timeout(seat_key.clone()))
            }
        }
    }
}

struct MemoryLock {
    table: Table,
    seat_key: SeatKey,
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl SeatLock for MemoryLock {
    fn seat_key(&self) -> &SeatKey {
        &self.seat_key
    }

    async fn unlock(self: Box<Self>) {
        debug!(seat = %self.seat_key, "Seat lock released");
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            prune(&self.table, &self.seat_key, OwnedMutexGuard::mutex(&guard));
        }
    }
}
