use tracing::{debug, warn};

use stalls_core::{Hold, HoldState, SeatStore, StoreError, StoreResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SettleOutcome {
    pub moved: usize,
    pub skipped: usize,
}

/// Moves every seat still held by `hold` to the status implied by `state`.
///
/// Seats no longer held by this hold (already settled, or since reassigned)
/// are skipped. Stops at the first infrastructure error; the hold then stays
/// unsettled and the sweeper finishes the job.
pub(crate) async fn settle_seats(
    seats: &dyn SeatStore,
    hold: &Hold,
    state: HoldState,
) -> StoreResult<SettleOutcome> {
    let mut outcome = SettleOutcome::default();
    let Some(target) = hold.settled_status(state) else {
        return Ok(outcome);
    };

    for key in &hold.seat_keys {
        let seat = match seats.get(key).await {
            Ok(seat) => seat,
            Err(StoreError::NotFound(_)) => {
                warn!(hold_id = %hold.hold_id, seat = %key, "Held seat no longer exists");
                outcome.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        if !seat.status.is_held_by(hold.hold_id) {
            outcome.skipped += 1;
            continue;
        }

        if seats.compare_and_set(&seat.transition_to(target.clone())).await? {
            debug!(hold_id = %hold.hold_id, seat = %key, status = target.label(), "Seat settled");
            outcome.moved += 1;
        } else {
            outcome.skipped += 1;
        }
    }
    Ok(outcome)
}
