use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use stalls_core::{
    ClaimantId, Clock, EventPublisher, Hold, HoldStore, ReservationError, ReservationEvent, Seat,
    SeatKey, SeatStore,
};

use crate::claim::PendingClaim;
use crate::coordinator::LockCoordinator;
use crate::retry::RetryPolicy;

/// How competing claimants are kept apart.
#[derive(Clone)]
pub enum ReservationStrategy {
    /// Lock every seat in canonical order, then check and transition under lock.
    Pessimistic(LockCoordinator),
    /// Read without locks, CAS every seat, roll back on a lost race and retry.
    Optimistic(RetryPolicy),
}

impl ReservationStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ReservationStrategy::Pessimistic(_) => "pessimistic",
            ReservationStrategy::Optimistic(_) => "optimistic",
        }
    }
}

/// Turns a request for a seat set into a hold, or a typed failure.
///
/// Both strategies claim seats through the same version-checked CAS and one
/// all-or-nothing claim routine; they differ in how they keep competing
/// claimants apart while doing it.
pub struct ReservationManager {
    seats: Arc<dyn SeatStore>,
    holds: Arc<dyn HoldStore>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    strategy: ReservationStrategy,
}

impl ReservationManager {
    pub fn new(
        seats: Arc<dyn SeatStore>,
        holds: Arc<dyn HoldStore>,
        clock: Arc<dyn Clock>,
        events: EventPublisher,
        strategy: ReservationStrategy,
    ) -> Self {
        Self {
            seats,
            holds,
            clock,
            events,
            strategy,
        }
    }

    pub fn strategy(&self) -> &ReservationStrategy {
        &self.strategy
    }

    /// Claims every seat in `seat_keys` for `claimant_id`, or none of them.
    pub async fn reserve(
        &self,
        claimant_id: ClaimantId,
        seat_keys: &[SeatKey],
        lease: Duration,
    ) -> Result<Hold, ReservationError> {
        let keys = canonical_seat_set(seat_keys)?;
        let lease = chrono::Duration::from_std(lease)
            .ok()
            .filter(|l| *l > chrono::Duration::zero())
            .ok_or_else(|| ReservationError::InvalidRequest("lease must be positive".into()))?;

        debug!(
            claimant_id = %claimant_id,
            seats = keys.len(),
            strategy = self.strategy.name(),
            "Reserving seats"
        );

        match &self.strategy {
            ReservationStrategy::Pessimistic(coordinator) => {
                self.reserve_pessimistic(coordinator, claimant_id, &keys, lease).await
            }
            ReservationStrategy::Optimistic(policy) => {
                self.reserve_optimistic(policy, claimant_id, &keys, lease).await
            }
        }
    }

    async fn reserve_pessimistic(
        &self,
        coordinator: &LockCoordinator,
        claimant_id: ClaimantId,
        keys: &[SeatKey],
        lease: chrono::Duration,
    ) -> Result<Hold, ReservationError> {
        let mut locks = coordinator.acquire_all(keys).await?;

        let outcome = match self.seats.get_many(keys).await {
            Ok(seats) => match conflicts(&seats) {
                Some(err) => Err(err),
                None => self.claim(claimant_id, seats, lease).await,
            },
            Err(e) => Err(e.into()),
        };

        coordinator.release_all(&mut locks).await;
        outcome
    }

    async fn reserve_optimistic(
        &self,
        policy: &RetryPolicy,
        claimant_id: ClaimantId,
        keys: &[SeatKey],
        lease: chrono::Duration,
    ) -> Result<Hold, ReservationError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let seats = self.seats.get_many(keys).await?;
            if let Some(err) = conflicts(&seats) {
                return Err(err);
            }

            match self.claim(claimant_id.clone(), seats, lease).await {
                Err(ReservationError::ConcurrentModification)
                    if policy.allows_another_attempt(attempts) =>
                {
                    let delay = policy.delay_for_retry(attempts - 1);
                    warn!(
                        claimant_id = %claimant_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Lost optimistic race, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Records the hold, then moves every seat from its read version to held.
    /// Any failure undoes whatever was written before returning.
    async fn claim(
        &self,
        claimant_id: ClaimantId,
        seats: Vec<Seat>,
        lease: chrono::Duration,
    ) -> Result<Hold, ReservationError> {
        let now = self.clock.now();
        let keys = seats.iter().map(|s| s.key.clone()).collect();
        let hold = Hold::new(claimant_id, keys, now, now + lease);
        let held = hold.held_status();

        let mut pending = PendingClaim::new(self.seats.clone(), self.holds.clone(), hold.hold_id);
        self.holds.insert(&hold).await?;
        pending.hold_recorded();

        for seat in &seats {
            let transition = seat.transition_to(held.clone());
            match self.seats.compare_and_set(&transition).await {
                Ok(true) => pending.applied(transition.applied()),
                Ok(false) => {
                    debug!(hold_id = %hold.hold_id, seat = %seat.key, "Seat version moved under us");
                    pending.rollback().await;
                    return Err(ReservationError::ConcurrentModification);
                }
                Err(e) => {
                    warn!(hold_id = %hold.hold_id, seat = %seat.key, error = %e, "Seat CAS failed");
                    pending.rollback().await;
                    return Err(e.into());
                }
            }
        }

        // A sweep may have ended the hold while seats were still being
        // claimed; seats moved after its settle pass would stay held forever.
        match self.holds.get(hold.hold_id).await {
            Ok(Some(current)) if current.is_active() => {}
            Ok(current) => {
                warn!(
                    hold_id = %hold.hold_id,
                    state = ?current.as_ref().map(|h| h.state),
                    "Hold ended before claim completed, rolling back"
                );
                if let Some(current) = current {
                    pending.hold_lapsed(current.state);
                }
                pending.rollback().await;
                return Err(ReservationError::ConcurrentModification);
            }
            Err(e) => {
                warn!(hold_id = %hold.hold_id, error = %e, "Hold re-check failed");
                pending.rollback().await;
                return Err(e.into());
            }
        }
        pending.commit();

        info!(
            hold_id = %hold.hold_id,
            claimant_id = %hold.claimant_id,
            seats = hold.seat_keys.len(),
            expires_at = %hold.expires_at,
            "Hold created"
        );
        self.events.publish(ReservationEvent::HoldCreated {
            hold_id: hold.hold_id,
            claimant_id: hold.claimant_id.clone(),
            seat_keys: hold.seat_keys.clone(),
            expires_at: hold.expires_at,
        });
        Ok(hold)
    }
}

/// Rejects empty and duplicate requests and returns the keys in canonical order.
pub fn canonical_seat_set(seat_keys: &[SeatKey]) -> Result<Vec<SeatKey>, ReservationError> {
    if seat_keys.is_empty() {
        return Err(ReservationError::InvalidRequest("no seats requested".into()));
    }
    let unique: BTreeSet<&SeatKey> = seat_keys.iter().collect();
    if unique.len() != seat_keys.len() {
        return Err(ReservationError::InvalidRequest(
            "duplicate seat in request".into(),
        ));
    }
    Ok(unique.into_iter().cloned().collect())
}

fn conflicts(seats: &[Seat]) -> Option<ReservationError> {
    let taken: Vec<SeatKey> = seats
        .iter()
        .filter(|s| !s.status.is_available())
        .map(|s| s.key.clone())
        .collect();
    if taken.is_empty() {
        None
    } else {
        Some(ReservationError::SeatUnavailable { seats: taken })
    }
}
