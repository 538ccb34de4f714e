use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one show (event instance) whose seat map is bookable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShowId(Uuid);

impl ShowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ShowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of one bookable seat: show plus physical seat label.
///
/// The derived ordering (show first, then label) is the canonical order in
/// which multi-seat claims acquire their locks.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeatKey {
    pub show_id: ShowId,
    pub seat: String,
}

impl SeatKey {
    pub fn new(show_id: ShowId, seat: impl Into<String>) -> Self {
        Self {
            show_id,
            seat: seat.into(),
        }
    }
}

impl fmt::Display for SeatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.show_id, self.seat)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldId(Uuid);

impl HoldId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HoldId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingId(Uuid);

impl BookingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user or session requesting seats. Opaque to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimantId(String);

impl ClaimantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seat status. Holder and lease expiry only exist while the seat is held.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Held {
        hold_id: HoldId,
        claimant_id: ClaimantId,
        expires_at: DateTime<Utc>,
    },
    Booked {
        hold_id: HoldId,
    },
}

impl SeatStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, SeatStatus::Available)
    }

    /// True when the seat is held on behalf of `hold_id`.
    pub fn is_held_by(&self, hold_id: HoldId) -> bool {
        matches!(self, SeatStatus::Held { hold_id: h, .. } if *h == hold_id)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SeatStatus::Available => "AVAILABLE",
            SeatStatus::Held { .. } => "HELD",
            SeatStatus::Booked { .. } => "BOOKED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub key: SeatKey,
    pub status: SeatStatus,
    pub version: u64,
}

impl Seat {
    /// A freshly provisioned seat.
    pub fn available(key: SeatKey) -> Self {
        Self {
            key,
            status: SeatStatus::Available,
            version: 0,
        }
    }

    pub fn held_by(&self) -> Option<&ClaimantId> {
        match &self.status {
            SeatStatus::Held { claimant_id, .. } => Some(claimant_id),
            _ => None,
        }
    }

    pub fn hold_expires_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            SeatStatus::Held { expires_at, .. } => Some(*expires_at),
            _ => None,
        }
    }

    /// The transition moving this seat, as currently read, to `status`.
    pub fn transition_to(&self, status: SeatStatus) -> SeatTransition {
        SeatTransition {
            key: self.key.clone(),
            expected_version: self.version,
            new_version: self.version + 1,
            status,
        }
    }
}

/// Argument of a version-checked seat update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeatTransition {
    pub key: SeatKey,
    pub expected_version: u64,
    pub new_version: u64,
    pub status: SeatStatus,
}

impl SeatTransition {
    /// The seat as it reads once this transition has been applied.
    pub fn applied(&self) -> Seat {
        Seat {
            key: self.key.clone(),
            status: self.status.clone(),
            version: self.new_version,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldState {
    Active,
    Finalized,
    Expired,
    Released,
}

impl HoldState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HoldState::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HoldState::Active => "ACTIVE",
            HoldState::Finalized => "FINALIZED",
            HoldState::Expired => "EXPIRED",
            HoldState::Released => "RELEASED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(HoldState::Active),
            "FINALIZED" => Some(HoldState::Finalized),
            "EXPIRED" => Some(HoldState::Expired),
            "RELEASED" => Some(HoldState::Released),
            _ => None,
        }
    }
}

impl fmt::Display for HoldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claimant's time-bounded, all-or-nothing claim on a set of seats.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub hold_id: HoldId,
    pub claimant_id: ClaimantId,
    /// Canonically ordered, never modified after creation.
    pub seat_keys: Vec<SeatKey>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: HoldState,
    /// Whether every seat already reflects the hold's terminal state.
    #[serde(default)]
    pub settled: bool,
}

impl Hold {
    pub fn new(
        claimant_id: ClaimantId,
        seat_keys: Vec<SeatKey>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            hold_id: HoldId::new(),
            claimant_id,
            seat_keys,
            created_at,
            expires_at,
            state: HoldState::Active,
            settled: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == HoldState::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The status every seat of this hold carries while it is active.
    pub fn held_status(&self) -> SeatStatus {
        SeatStatus::Held {
            hold_id: self.hold_id,
            claimant_id: self.claimant_id.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Where seats go once the hold is in `state`; `None` while active.
    pub fn settled_status(&self, state: HoldState) -> Option<SeatStatus> {
        match state {
            HoldState::Active => None,
            HoldState::Finalized => Some(SeatStatus::Booked {
                hold_id: self.hold_id,
            }),
            HoldState::Expired | HoldState::Released => Some(SeatStatus::Available),
        }
    }
}

/// Permanent record of a confirmed hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: BookingId,
    pub hold_id: HoldId,
    pub claimant_id: ClaimantId,
    pub seat_keys: Vec<SeatKey>,
    pub confirmed_at: DateTime<Utc>,
}
