use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{BookingId, ClaimantId, HoldId, SeatKey};

/// Lifecycle notifications emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReservationEvent {
    HoldCreated {
        hold_id: HoldId,
        claimant_id: ClaimantId,
        seat_keys: Vec<SeatKey>,
        expires_at: DateTime<Utc>,
    },
    BookingConfirmed {
        booking_id: BookingId,
        hold_id: HoldId,
        seat_keys: Vec<SeatKey>,
        confirmed_at: DateTime<Utc>,
    },
    HoldReleased {
        hold_id: HoldId,
        seat_keys: Vec<SeatKey>,
    },
    HoldExpired {
        hold_id: HoldId,
        seat_keys: Vec<SeatKey>,
    },
}

impl ReservationEvent {
    pub fn hold_id(&self) -> HoldId {
        match self {
            ReservationEvent::HoldCreated { hold_id, .. }
            | ReservationEvent::BookingConfirmed { hold_id, .. }
            | ReservationEvent::HoldReleased { hold_id, .. }
            | ReservationEvent::HoldExpired { hold_id, .. } => *hold_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReservationEvent::HoldCreated { .. } => "hold_created",
            ReservationEvent::BookingConfirmed { .. } => "booking_confirmed",
            ReservationEvent::HoldReleased { .. } => "hold_released",
            ReservationEvent::HoldExpired { .. } => "hold_expired",
        }
    }
}

/// Fan-out of engine events to any number of in-process subscribers.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<ReservationEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReservationEvent> {
        self.tx.subscribe()
    }

    /// Never fails the caller; an event with no subscribers is dropped.
    pub fn publish(&self, event: ReservationEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "No subscribers for reservation event");
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}
