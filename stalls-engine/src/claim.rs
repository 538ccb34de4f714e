use std::sync::Arc;
use tracing::{debug, error, warn};

use stalls_core::{HoldId, HoldState, HoldStore, Seat, SeatStatus, SeatStore};

/// What the attempt knows about its hold record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldRecord {
    Missing,
    Recorded,
    /// Ended by someone else (the sweeper) while seats were being claimed.
    Lapsed(HoldState),
}

/// Tracks what a reservation attempt has written so far, so it can be undone.
///
/// Rolled back explicitly when the attempt fails, and from `Drop` when the
/// caller abandons the attempt mid-way.
pub(crate) struct PendingClaim {
    seats: Arc<dyn SeatStore>,
    holds: Arc<dyn HoldStore>,
    hold_id: HoldId,
    hold: HoldRecord,
    applied: Vec<Seat>,
    armed: bool,
}

impl PendingClaim {
    pub(crate) fn new(seats: Arc<dyn SeatStore>, holds: Arc<dyn HoldStore>, hold_id: HoldId) -> Self {
        Self {
            seats,
            holds,
            hold_id,
            hold: HoldRecord::Missing,
            applied: Vec::new(),
            armed: true,
        }
    }

    pub(crate) fn hold_recorded(&mut self) {
        self.hold = HoldRecord::Recorded;
    }

    /// The hold left `Active` under us. Rollback then hands it back to the
    /// sweeper instead of discarding it.
    pub(crate) fn hold_lapsed(&mut self, state: HoldState) {
        self.hold = HoldRecord::Lapsed(state);
    }

    /// Records a seat as it reads after a successful CAS.
    pub(crate) fn applied(&mut self, seat: Seat) {
        self.applied.push(seat);
    }

    pub(crate) fn commit(mut self) {
        self.armed = false;
    }

    pub(crate) async fn rollback(mut self) {
        self.armed = false;
        undo(
            self.seats.clone(),
            self.holds.clone(),
            self.hold_id,
            std::mem::take(&mut self.applied),
            self.hold,
        )
        .await;
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        if !self.armed || (self.hold == HoldRecord::Missing && self.applied.is_empty()) {
            return;
        }
        let seats = self.seats.clone();
        let holds = self.holds.clone();
        let hold_id = self.hold_id;
        let applied = std::mem::take(&mut self.applied);
        let hold = self.hold;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(hold_id = %hold_id, seats = applied.len(), "Reservation abandoned, rolling back");
                handle.spawn(undo(seats, holds, hold_id, applied, hold));
            }
            // Hold is still active; the sweeper reclaims it once the lease ends.
            Err(_) => error!(hold_id = %hold_id, "Reservation abandoned outside a runtime"),
        }
    }
}

async fn undo(
    seats: Arc<dyn SeatStore>,
    holds: Arc<dyn HoldStore>,
    hold_id: HoldId,
    applied: Vec<Seat>,
    hold: HoldRecord,
) {
    let mut clean = true;
    for seat in applied.iter().rev() {
        match seats.compare_and_set(&seat.transition_to(SeatStatus::Available)).await {
            Ok(true) => debug!(hold_id = %hold_id, seat = %seat.key, "Rolled back seat"),
            Ok(false) => warn!(
                hold_id = %hold_id,
                seat = %seat.key,
                "Seat moved before rollback, leaving it as is"
            ),
            Err(e) => {
                error!(hold_id = %hold_id, seat = %seat.key, error = %e, "Seat rollback failed");
                clean = false;
            }
        }
    }

    match hold {
        HoldRecord::Missing => return,
        HoldRecord::Lapsed(state) => {
            // Reopen settlement so a sweep re-checks every seat of the hold,
            // including any this rollback could not move.
            match holds.transition(hold_id, state, state).await {
                Ok(_) => warn!(hold_id = %hold_id, state = %state, "Hold lapsed during claim, handed to sweeper"),
                Err(e) => error!(hold_id = %hold_id, error = %e, "Failed to reopen lapsed hold"),
            }
            return;
        }
        HoldRecord::Recorded => {}
    }
    if clean {
        if let Err(e) = holds.discard(hold_id).await {
            error!(hold_id = %hold_id, error = %e, "Failed to discard rolled back hold");
        }
        return;
    }
    // Leave the leftovers to the sweeper, which settles released holds.
    match holds.transition(hold_id, HoldState::Active, HoldState::Released).await {
        Ok(_) => warn!(hold_id = %hold_id, "Partial rollback, hold handed to sweeper"),
        Err(e) => error!(hold_id = %hold_id, error = %e, "Failed to release partially rolled back hold"),
    }
}
