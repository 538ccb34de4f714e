use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::model::{Hold, HoldId, HoldState, Seat, SeatKey, SeatTransition};

/// Authoritative seat state for every provisioned show.
///
/// All seat mutation after provisioning goes through `compare_and_set`.
#[async_trait]
pub trait SeatStore: Send + Sync {
    /// Creates missing seats as available at version 0. Existing seats are
    /// left untouched. Returns how many seats were created.
    async fn provision(&self, seat_keys: &[SeatKey]) -> StoreResult<usize>;

    async fn get(&self, seat_key: &SeatKey) -> StoreResult<Seat>;

    /// Reads seats in request order, failing on the first unknown key.
    async fn get_many(&self, seat_keys: &[SeatKey]) -> StoreResult<Vec<Seat>>;

    /// Applies `transition` only if the stored version equals
    /// `transition.expected_version`. A mismatch returns `Ok(false)` and
    /// changes nothing.
    async fn compare_and_set(&self, transition: &SeatTransition) -> StoreResult<bool>;
}

/// Shared hold records, so that every engine instance and the sweeper see
/// the same leases.
#[async_trait]
pub trait HoldStore: Send + Sync {
    async fn insert(&self, hold: &Hold) -> StoreResult<()>;

    async fn get(&self, hold_id: HoldId) -> StoreResult<Option<Hold>>;

    /// Moves the hold from `from` to `to` if it is currently in `from`.
    /// Entering a terminal state marks the hold unsettled; `from == to` on a
    /// terminal state reopens settlement.
    async fn transition(&self, hold_id: HoldId, from: HoldState, to: HoldState)
        -> StoreResult<bool>;

    /// Records that every seat now reflects the hold's terminal state.
    async fn mark_settled(&self, hold_id: HoldId) -> StoreResult<()>;

    /// Removes a hold that was never handed to a caller.
    async fn discard(&self, hold_id: HoldId) -> StoreResult<()>;

    /// Active holds whose lease ended at or before `now`, followed by
    /// terminal holds still waiting to be settled. At most `limit` entries.
    async fn due_for_sweep(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Hold>>;

    /// Deletes settled terminal holds whose lease ended before `cutoff`, at
    /// most `limit` of them, and returns how many went. Backends that expire
    /// settled records on their own keep the default.
    async fn prune_settled(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<usize> {
        let _ = (cutoff, limit);
        Ok(0)
    }
}

/// Validates the version rule every backend enforces before applying a transition.
pub fn check_transition(transition: &SeatTransition) -> StoreResult<()> {
    if transition.new_version != transition.expected_version + 1 {
        return Err(crate::error::StoreError::InvalidTransition {
            key: transition.key.clone(),
            expected: transition.expected_version,
            new: transition.new_version,
        });
    }
    Ok(())
}
