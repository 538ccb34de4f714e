use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use stalls_core::ReservationEvent;

/// Logs every reservation event until shutdown or until the engine goes away.
pub async fn run_event_logger(
    mut events: broadcast::Receiver<ReservationEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Event logger started, listening to reservation events...");

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Event logger stopped");
}

fn log_event(event: &ReservationEvent) {
    match serde_json::to_string(event) {
        Ok(payload) => info!(
            event = event.name(),
            hold_id = %event.hold_id(),
            %payload,
            "Reservation event"
        ),
        Err(e) => error!(event = event.name(), error = %e, "Failed to encode event"),
    }
}
