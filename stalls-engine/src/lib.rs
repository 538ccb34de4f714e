mod claim;
pub mod coordinator;
pub mod finalizer;
pub mod manager;
pub mod retry;
mod settle;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use stalls_core::{
    Booking, ClaimantId, Clock, EventPublisher, FinalizeError, Hold, HoldId, HoldStore,
    LockingStrategy, ReservationError, ReservationEvent, Seat, SeatKey, SeatLocks, SeatStore,
    StoreError, SystemClock,
};
use stalls_store::app_config::ConfigError;
use stalls_store::{
    Config, InMemoryHoldStore, InMemorySeatLocks, InMemorySeatStore, RedisClient, RedisHoldStore,
    RedisSeatLocks, RedisSeatStore, StoreBackend,
};

pub use coordinator::{LockCoordinator, LockSet};
pub use finalizer::BookingFinalizer;
pub use manager::{ReservationManager, ReservationStrategy};
pub use retry::RetryPolicy;
pub use sweeper::{HoldSweeper, SweepReport};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Locking strategy {0:?} is not supported across processes")]
    UnsupportedStrategy(LockingStrategy),
    #[error("Invalid engine settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Concurrent seat reservation as its collaborators see it: holds, bookings
/// and lease expiry on top of a version-checked seat store.
pub struct ReservationEngine {
    seats: Arc<dyn SeatStore>,
    manager: ReservationManager,
    finalizer: BookingFinalizer,
    sweeper: Arc<HoldSweeper>,
    events: EventPublisher,
    default_lease: Duration,
}

impl ReservationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Builds an engine on the backend named by `config`.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        config.validate()?;
        let engine = &config.engine;

        let builder = Self::builder()
            .strategy(engine.strategy)
            .lease(engine.lease())
            .lock_timeout(engine.lock_timeout())
            .retry(RetryPolicy {
                max_attempts: engine.max_attempts,
                initial_delay: Duration::from_millis(engine.backoff_initial_ms),
                max_delay: Duration::from_millis(engine.backoff_max_ms),
                ..RetryPolicy::default()
            })
            .sweep_batch(config.sweeper.batch_size)
            .retention(config.sweeper.retention());

        let builder = match config.store.backend {
            StoreBackend::Memory => builder,
            StoreBackend::Redis => {
                let redis = RedisClient::new(&config.redis.url, &config.redis.key_prefix)
                    .map_err(|e| EngineError::Backend(e.to_string()))?;
                builder
                    .seats(Arc::new(RedisSeatStore::new(redis.clone())))
                    .holds(Arc::new(
                        RedisHoldStore::new(redis.clone()).with_retention(config.sweeper.retention()),
                    ))
                    .locks(Arc::new(RedisSeatLocks::new(redis, config.redis.lock_ttl())))
            }
        };
        builder.build()
    }

    /// Creates any missing seats as available. Returns how many were created.
    pub async fn provision(&self, seat_keys: &[SeatKey]) -> Result<usize, StoreError> {
        let created = self.seats.provision(seat_keys).await?;
        info!(requested = seat_keys.len(), created, "Seats provisioned");
        Ok(created)
    }

    pub async fn reserve(
        &self,
        claimant_id: ClaimantId,
        seat_keys: &[SeatKey],
        lease: Duration,
    ) -> Result<Hold, ReservationError> {
        self.manager.reserve(claimant_id, seat_keys, lease).await
    }

    /// `reserve` with the configured lease.
    pub async fn reserve_default(
        &self,
        claimant_id: ClaimantId,
        seat_keys: &[SeatKey],
    ) -> Result<Hold, ReservationError> {
        self.manager
            .reserve(claimant_id, seat_keys, self.default_lease)
            .await
    }

    pub async fn confirm(&self, hold_id: HoldId) -> Result<Booking, FinalizeError> {
        self.finalizer.confirm(hold_id).await
    }

    pub async fn release(&self, hold_id: HoldId) -> Result<(), FinalizeError> {
        self.finalizer.release(hold_id).await
    }

    /// Read-only availability lookup, in request order.
    pub async fn seat_status(&self, seat_keys: &[SeatKey]) -> Result<Vec<Seat>, ReservationError> {
        Ok(self.seats.get_many(seat_keys).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReservationEvent> {
        self.events.subscribe()
    }

    pub fn sweeper(&self) -> Arc<HoldSweeper> {
        self.sweeper.clone()
    }

    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    pub fn strategy(&self) -> &ReservationStrategy {
        self.manager.strategy()
    }
}

/// Assembles a [`ReservationEngine`]. Unset stores default to the in-memory
/// backends and the clock to the system clock.
pub struct EngineBuilder {
    seats: Option<Arc<dyn SeatStore>>,
    holds: Option<Arc<dyn HoldStore>>,
    locks: Option<Arc<dyn SeatLocks>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventPublisher>,
    strategy: LockingStrategy,
    lock_timeout: Duration,
    retry: RetryPolicy,
    lease: Duration,
    sweep_batch: usize,
    retention: Duration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            seats: None,
            holds: None,
            locks: None,
            clock: None,
            events: None,
            strategy: LockingStrategy::default(),
            lock_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            lease: Duration::from_secs(300),
            sweep_batch: 500,
            retention: Duration::from_secs(86_400),
        }
    }
}

impl EngineBuilder {
    pub fn seats(mut self, seats: Arc<dyn SeatStore>) -> Self {
        self.seats = Some(seats);
        self
    }

    pub fn holds(mut self, holds: Arc<dyn HoldStore>) -> Self {
        self.holds = Some(holds);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn SeatLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn strategy(mut self, strategy: LockingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn sweep_batch(mut self, sweep_batch: usize) -> Self {
        self.sweep_batch = sweep_batch;
        self
    }

    /// How long settled holds stay readable before the sweeper deletes them.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn build(self) -> Result<ReservationEngine, EngineError> {
        if self.lease.is_zero() {
            return Err(EngineError::InvalidSettings("lease must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidSettings(
                "max_attempts must be at least 1".into(),
            ));
        }

        let seats = self
            .seats
            .unwrap_or_else(|| Arc::new(InMemorySeatStore::new()));
        let holds = self
            .holds
            .unwrap_or_else(|| Arc::new(InMemoryHoldStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();

        let strategy = match self.strategy {
            LockingStrategy::Pessimistic => {
                let locks = self
                    .locks
                    .unwrap_or_else(|| Arc::new(InMemorySeatLocks::new()));
                ReservationStrategy::Pessimistic(LockCoordinator::new(locks, self.lock_timeout))
            }
            LockingStrategy::Optimistic => ReservationStrategy::Optimistic(self.retry),
            other => return Err(EngineError::UnsupportedStrategy(other)),
        };
        info!(strategy = strategy.name(), lease_secs = self.lease.as_secs(), "Reservation engine ready");

        Ok(ReservationEngine {
            manager: ReservationManager::new(
                seats.clone(),
                holds.clone(),
                clock.clone(),
                events.clone(),
                strategy,
            ),
            finalizer: BookingFinalizer::new(seats.clone(), holds.clone(), clock.clone(), events.clone()),
            sweeper: Arc::new(HoldSweeper::new(
                seats.clone(),
                holds,
                clock,
                events.clone(),
                self.sweep_batch,
            )
            .with_retention(self.retention)),
            seats,
            events,
            default_lease: self.lease,
        })
    }
}
