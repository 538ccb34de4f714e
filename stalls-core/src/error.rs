use chrono::{DateTime, Utc};

use crate::model::{HoldId, HoldState, SeatKey};

/// Failures raised by seat and hold storage backends.
///
/// A version mismatch is not an error: `compare_and_set` reports it as `Ok(false)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Seat not found: {0}")]
    NotFound(SeatKey),
    #[error("Hold not found: {0}")]
    HoldNotFound(HoldId),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Invalid transition for {key}: version {expected} -> {new}")]
    InvalidTransition { key: SeatKey, expected: u64, new: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised while acquiring a seat lock.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("Timed out waiting for lock on {0}")]
    Timeout(SeatKey),
    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a failed `reserve`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Seat not found: {0}")]
    NotFound(SeatKey),
    #[error("Seats unavailable: {}", format_keys(.seats))]
    SeatUnavailable { seats: Vec<SeatKey> },
    #[error("Seats were modified concurrently, retry the request")]
    ConcurrentModification,
    #[error("Timed out waiting for lock on {seat}")]
    LockTimeout { seat: SeatKey },
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ReservationError {
    /// Whether re-running the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReservationError::ConcurrentModification | ReservationError::LockTimeout { .. }
        )
    }
}

impl From<StoreError> for ReservationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ReservationError::NotFound(key),
            other => ReservationError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<LockError> for ReservationError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout(seat) => ReservationError::LockTimeout { seat },
            LockError::Unavailable(msg) => ReservationError::StoreUnavailable(msg),
        }
    }
}

/// Outcome of a failed `confirm` or `release`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FinalizeError {
    #[error("Hold not found: {0}")]
    HoldNotFound(HoldId),
    #[error("Hold {hold_id} already terminated ({state})")]
    HoldAlreadyTerminated { hold_id: HoldId, state: HoldState },
    #[error("Hold {hold_id} expired at {expired_at}")]
    HoldExpired {
        hold_id: HoldId,
        expired_at: DateTime<Utc>,
    },
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for FinalizeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::HoldNotFound(id) => FinalizeError::HoldNotFound(id),
            other => FinalizeError::StoreUnavailable(other.to_string()),
        }
    }
}

fn format_keys(keys: &[SeatKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
