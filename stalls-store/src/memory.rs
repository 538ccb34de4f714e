use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use stalls_core::store::check_transition;
use stalls_core::{
    Hold, HoldId, HoldState, HoldStore, Seat, SeatKey, SeatStore, SeatTransition, StoreError,
    StoreResult,
};

/// Single-process seat store. Every read and CAS runs under one lock, which
/// makes it linearizable.
#[derive(Default)]
pub struct InMemorySeatStore {
    seats: RwLock<HashMap<SeatKey, Seat>>,
}

impl InMemorySeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seats.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SeatStore for InMemorySeatStore {
    async fn provision(&self, seat_keys: &[SeatKey]) -> StoreResult<usize> {
        let mut seats = self.seats.write().unwrap_or_else(PoisonError::into_inner);
        let mut created = 0;
        for key in seat_keys {
            if !seats.contains_key(key) {
                seats.insert(key.clone(), Seat::available(key.clone()));
                created += 1;
            }
        }
        debug!(requested = seat_keys.len(), created, "Provisioned seats");
        Ok(created)
    }

    async fn get(&self, seat_key: &SeatKey) -> StoreResult<Seat> {
        let seats = self.seats.read().unwrap_or_else(PoisonError::into_inner);
        seats
            .get(seat_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(seat_key.clone()))
    }

    async fn get_many(&self, seat_keys: &[SeatKey]) -> StoreResult<Vec<Seat>> {
        let seats = self.seats.read().unwrap_or_else(PoisonError::into_inner);
        seat_keys
            .iter()
            .map(|key| {
                seats
                    .get(key)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(key.clone()))
            })
            .collect()
    }

    async fn compare_and_set(&self, transition: &SeatTransition) -> StoreResult<bool> {
        check_transition(transition)?;
        let mut seats = self.seats.write().unwrap_or_else(PoisonError::into_inner);
        let seat = seats
            .get_mut(&transition.key)
            .ok_or_else(|| StoreError::NotFound(transition.key.clone()))?;

        if seat.version != transition.expected_version {
            return Ok(false);
        }
        seat.status = transition.status.clone();
        seat.version = transition.new_version;
        Ok(true)
    }
}

/// Single-process hold store.
#[derive(Default)]
pub struct InMemoryHoldStore {
    holds: RwLock<HashMap<HoldId, Hold>>,
}

impl InMemoryHoldStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HoldStore for InMemoryHoldStore {
    async fn insert(&self, hold: &Hold) -> StoreResult<()> {
        let mut holds = self.holds.write().unwrap_or_else(PoisonError::into_inner);
        holds.insert(hold.hold_id, hold.clone());
        Ok(())
    }

    async fn get(&self, hold_id: HoldId) -> StoreResult<Option<Hold>> {
        let holds = self.holds.read().unwrap_or_else(PoisonError::into_inner);
        Ok(holds.get(&hold_id).cloned())
    }

    async fn transition(
        &self,
        hold_id: HoldId,
        from: HoldState,
        to: HoldState,
    ) -> StoreResult<bool> {
        let mut holds = self.holds.write().unwrap_or_else(PoisonError::into_inner);
        let hold = holds
            .get_mut(&hold_id)
            .ok_or(StoreError::HoldNotFound(hold_id))?;

        if hold.state != from {
            return Ok(false);
        }
        hold.state = to;
        if to.is_terminal() {
            hold.settled = false;
        }
        Ok(true)
    }

    async fn mark_settled(&self, hold_id: HoldId) -> StoreResult<()> {
        let mut holds = self.holds.write().unwrap_or_else(PoisonError::into_inner);
        let hold = holds
            .get_mut(&hold_id)
            .ok_or(StoreError::HoldNotFound(hold_id))?;
        hold.settled = true;
        Ok(())
    }

    async fn discard(&self, hold_id: HoldId) -> StoreResult<()> {
        let mut holds = self.holds.write().unwrap_or_else(PoisonError::into_inner);
        holds.remove(&hold_id);
        Ok(())
    }

    async fn due_for_sweep(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Hold>> {
        let holds = self.holds.read().unwrap_or_else(PoisonError::into_inner);

        let mut expired: Vec<Hold> = holds
            .values()
            .filter(|h| h.is_active() && h.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|h| h.expires_at);

        let unsettled = holds
            .values()
            .filter(|h| h.state.is_terminal() && !h.settled)
            .cloned();

        Ok(expired.into_iter().chain(unsettled).take(limit).collect())
    }

    async fn prune_settled(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<usize> {
        let mut holds = self.holds.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<HoldId> = holds
            .values()
            .filter(|h| h.state.is_terminal() && h.settled && h.expires_at < cutoff)
            .map(|h| h.hold_id)
            .take(limit)
            .collect();
        for hold_id in &stale {
            holds.remove(hold_id);
        }
        Ok(stale.len())
    }
}
