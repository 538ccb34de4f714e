use std::sync::Arc;
use tracing::{debug, error, info, warn};

use stalls_core::{
    Booking, BookingId, Clock, EventPublisher, FinalizeError, Hold, HoldId, HoldState, HoldStore,
    ReservationEvent, SeatStore,
};

use crate::settle::settle_seats;

/// Terminal transitions of a hold, driven by the payment outcome.
pub struct BookingFinalizer {
    seats: Arc<dyn SeatStore>,
    holds: Arc<dyn HoldStore>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
}

impl BookingFinalizer {
    pub fn new(
        seats: Arc<dyn SeatStore>,
        holds: Arc<dyn HoldStore>,
        clock: Arc<dyn Clock>,
        events: EventPublisher,
    ) -> Self {
        Self {
            seats,
            holds,
            clock,
            events,
        }
    }

    /// Books every seat of an active, unexpired hold.
    ///
    /// Expiry is checked against the clock here, so a lapsed hold cannot be
    /// confirmed even if no sweep has run yet.
    pub async fn confirm(&self, hold_id: HoldId) -> Result<Booking, FinalizeError> {
        let hold = self.load(hold_id).await?;
        if !hold.is_active() {
            return Err(terminated(&hold));
        }

        let now = self.clock.now();
        if hold.is_expired_at(now) {
            debug!(hold_id = %hold_id, expires_at = %hold.expires_at, "Confirm after lease end");
            return Err(FinalizeError::HoldExpired {
                hold_id,
                expired_at: hold.expires_at,
            });
        }

        if !self
            .holds
            .transition(hold_id, HoldState::Active, HoldState::Finalized)
            .await?
        {
            // Lost to release or the sweeper.
            let current = self.load(hold_id).await?;
            return Err(terminated(&current));
        }

        self.settle(&hold, HoldState::Finalized).await?;

        let booking = Booking {
            booking_id: BookingId::new(),
            hold_id,
            claimant_id: hold.claimant_id.clone(),
            seat_keys: hold.seat_keys.clone(),
            confirmed_at: now,
        };
        info!(
            hold_id = %hold_id,
            booking_id = %booking.booking_id,
            claimant_id = %booking.claimant_id,
            seats = booking.seat_keys.len(),
            "Booking confirmed"
        );
        self.events.publish(ReservationEvent::BookingConfirmed {
            booking_id: booking.booking_id,
            hold_id,
            seat_keys: booking.seat_keys.clone(),
            confirmed_at: booking.confirmed_at,
        });
        Ok(booking)
    }

    /// Returns the hold's seats to availability. Releasing a hold that has
    /// already ended is a no-op.
    pub async fn release(&self, hold_id: HoldId) -> Result<(), FinalizeError> {
        let hold = self.load(hold_id).await?;
        if !hold.is_active() {
            debug!(hold_id = %hold_id, state = %hold.state, "Release of ended hold ignored");
            return Ok(());
        }

        if !self
            .holds
            .transition(hold_id, HoldState::Active, HoldState::Released)
            .await?
        {
            debug!(hold_id = %hold_id, "Hold ended concurrently, nothing to release");
            return Ok(());
        }

        self.settle(&hold, HoldState::Released).await?;

        info!(hold_id = %hold_id, seats = hold.seat_keys.len(), "Hold released");
        self.events.publish(ReservationEvent::HoldReleased {
            hold_id,
            seat_keys: hold.seat_keys.clone(),
        });
        Ok(())
    }

    async fn load(&self, hold_id: HoldId) -> Result<Hold, FinalizeError> {
        self.holds
            .get(hold_id)
            .await?
            .ok_or(FinalizeError::HoldNotFound(hold_id))
    }

    /// Moves the seats of a hold this finalizer just claimed. On an
    /// infrastructure failure the hold stays unsettled for the sweeper.
    async fn settle(&self, hold: &Hold, state: HoldState) -> Result<(), FinalizeError> {
        let outcome = match settle_seats(self.seats.as_ref(), hold, state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    hold_id = %hold.hold_id,
                    state = %state,
                    error = %e,
                    "Seat settlement failed, leaving hold to the sweeper"
                );
                return Err(e.into());
            }
        };
        if outcome.skipped > 0 {
            warn!(
                hold_id = %hold.hold_id,
                skipped = outcome.skipped,
                "Some seats were no longer held by this hold"
            );
        }
        if let Err(e) = self.holds.mark_settled(hold.hold_id).await {
            error!(hold_id = %hold.hold_id, error = %e, "Failed to mark hold settled");
        }
        Ok(())
    }
}

fn terminated(hold: &Hold) -> FinalizeError {
    match hold.state {
        HoldState::Expired => FinalizeError::HoldExpired {
            hold_id: hold.hold_id,
            expired_at: hold.expires_at,
        },
        state => FinalizeError::HoldAlreadyTerminated {
            hold_id: hold.hold_id,
            state,
        },
    }
}
