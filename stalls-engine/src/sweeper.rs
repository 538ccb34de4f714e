use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use stalls_core::{
    Clock, EventPublisher, Hold, HoldState, HoldStore, ReservationEvent, SeatStore, StoreError,
};

use crate::settle::settle_seats;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Active holds moved to `Expired` by this pass.
    pub expired: usize,
    /// Terminal holds whose seats now all reflect their state.
    pub settled: usize,
    pub seats_released: usize,
    /// Settled holds deleted once past retention.
    pub pruned: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Background reclamation of lapsed holds.
pub struct HoldSweeper {
    seats: Arc<dyn SeatStore>,
    holds: Arc<dyn HoldStore>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    batch_size: usize,
    retention: Duration,
}

impl HoldSweeper {
    pub fn new(
        seats: Arc<dyn SeatStore>,
        holds: Arc<dyn HoldStore>,
        clock: Arc<dyn Clock>,
        events: EventPublisher,
        batch_size: usize,
    ) -> Self {
        Self {
            seats,
            holds,
            clock,
            events,
            batch_size: batch_size.max(1),
            retention: Duration::from_secs(86_400),
        }
    }

    /// How long a settled hold stays readable after its lease ended.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(self.clock.now()).await
    }

    /// One pass: expire every active hold whose lease ended at or before
    /// `now`, and finish settling terminal holds left half done.
    ///
    /// Settled holds older than the retention window are deleted last.
    /// Failures on individual holds are counted and left for the next pass.
    /// Only failing to list the due holds aborts the pass.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let due = self.holds.due_for_sweep(now, self.batch_size).await?;
        let mut report = SweepReport::default();

        for hold in due {
            let state = if hold.is_active() {
                match self
                    .holds
                    .transition(hold.hold_id, HoldState::Active, HoldState::Expired)
                    .await
                {
                    Ok(true) => {
                        report.expired += 1;
                        info!(hold_id = %hold.hold_id, seats = hold.seat_keys.len(), "Hold expired");
                        self.events.publish(ReservationEvent::HoldExpired {
                            hold_id: hold.hold_id,
                            seat_keys: hold.seat_keys.clone(),
                        });
                        HoldState::Expired
                    }
                    Ok(false) => {
                        // Finalized or released since listing; the next pass
                        // settles it if its owner did not.
                        debug!(hold_id = %hold.hold_id, "Hold ended before sweep");
                        continue;
                    }
                    Err(e) => {
                        warn!(hold_id = %hold.hold_id, error = %e, "Failed to expire hold");
                        report.errors += 1;
                        continue;
                    }
                }
            } else {
                hold.state
            };

            self.settle(&hold, state, &mut report).await;
        }

        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            match self.holds.prune_settled(cutoff, self.batch_size).await {
                Ok(pruned) => report.pruned = pruned,
                Err(e) => {
                    warn!(error = %e, "Failed to prune settled holds");
                    report.errors += 1;
                }
            }
        }

        if !report.is_idle() {
            info!(
                expired = report.expired,
                settled = report.settled,
                seats_released = report.seats_released,
                pruned = report.pruned,
                errors = report.errors,
                "Sweep pass complete"
            );
        }
        Ok(report)
    }

    async fn settle(&self, hold: &Hold, state: HoldState, report: &mut SweepReport) {
        let outcome = match settle_seats(self.seats.as_ref(), hold, state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(hold_id = %hold.hold_id, state = %state, error = %e, "Failed to settle seats");
                report.errors += 1;
                return;
            }
        };

        if state != HoldState::Finalized {
            report.seats_released += outcome.moved;
        }
        if let Err(e) = self.holds.mark_settled(hold.hold_id).await {
            warn!(hold_id = %hold.hold_id, error = %e, "Failed to mark hold settled");
            report.errors += 1;
            return;
        }
        report.settled += 1;
        debug!(hold_id = %hold.hold_id, state = %state, seats = outcome.moved, "Hold settled");
    }

    /// Runs a pass every `interval` until `shutdown` turns true.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Hold sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!(error = %e, "Sweep pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Hold sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stalls_core::{ClaimantId, ManualClock, SeatKey, SeatStatus, ShowId};
    use stalls_store::{InMemoryHoldStore, InMemorySeatStore};

    use crate::finalizer::BookingFinalizer;
    use crate::manager::{ReservationManager, ReservationStrategy};
    use crate::retry::RetryPolicy;

    struct Fixture {
        seats: Arc<InMemorySeatStore>,
        holds: Arc<InMemoryHoldStore>,
        clock: Arc<ManualClock>,
        events: EventPublisher,
        manager: ReservationManager,
        sweeper: HoldSweeper,
        keys: Vec<SeatKey>,
    }

    async fn fixture() -> Fixture {
        let seats = Arc::new(InMemorySeatStore::new());
        let holds = Arc::new(InMemoryHoldStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = EventPublisher::default();
        let show = ShowId::new();
        let keys = vec![SeatKey::new(show, "A1"), SeatKey::new(show, "A2")];
        seats.provision(&keys).await.unwrap();

        Fixture {
            manager: ReservationManager::new(
                seats.clone(),
                holds.clone(),
                clock.clone(),
                events.clone(),
                ReservationStrategy::Optimistic(RetryPolicy::default()),
            ),
            sweeper: HoldSweeper::new(seats.clone(), holds.clone(), clock.clone(), events.clone(), 100),
            seats,
            holds,
            clock,
            events,
            keys,
        }
    }

    async fn hold(f: &Fixture) -> Hold {
        f.manager
            .reserve(ClaimantId::new("x"), &f.keys, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn live_holds_are_left_alone() {
        let f = fixture().await;
        hold(&f).await;

        let report = f.sweeper.sweep_once().await.unwrap();
        assert!(report.is_idle());
    }

    #[tokio::test]
    async fn lapsed_hold_is_expired_and_seats_freed() {
        let f = fixture().await;
        let mut events = f.events.subscribe();
        let hold = hold(&f).await;
        f.clock.advance(chrono::Duration::seconds(1));

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired: 1,
                settled: 1,
                seats_released: 2,
                pruned: 0,
                errors: 0
            }
        );

        for seat in f.seats.get_many(&f.keys).await.unwrap() {
            assert_eq!(seat.status, SeatStatus::Available);
        }
        let stored = f.holds.get(hold.hold_id).await.unwrap().unwrap();
        assert_eq!(stored.state, HoldState::Expired);
        assert!(stored.settled);

        assert_eq!(events.recv().await.unwrap().name(), "hold_created");
        assert_eq!(
            events.recv().await.unwrap(),
            ReservationEvent::HoldExpired {
                hold_id: hold.hold_id,
                seat_keys: f.keys.clone()
            }
        );
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let f = fixture().await;
        hold(&f).await;
        f.clock.advance(chrono::Duration::seconds(5));

        f.sweeper.sweep_once().await.unwrap();
        let second = f.sweeper.sweep_once().await.unwrap();
        assert!(second.is_idle());
    }

    #[tokio::test]
    async fn stale_sweep_never_touches_a_reassigned_seat() {
        let f = fixture().await;
        let first = hold(&f).await;
        f.clock.advance(chrono::Duration::seconds(2));
        f.sweeper.sweep_once().await.unwrap();

        let second = hold(&f).await;
        // Replay the first hold as if a crashed sweeper listed it again.
        let replayed = Hold {
            state: HoldState::Expired,
            settled: false,
            ..first
        };
        let mut report = SweepReport::default();
        f.sweeper.settle(&replayed, HoldState::Expired, &mut report).await;
        assert_eq!(report.seats_released, 0);

        for seat in f.seats.get_many(&f.keys).await.unwrap() {
            assert!(seat.status.is_held_by(second.hold_id));
        }
    }

    #[tokio::test]
    async fn unsettled_finalized_hold_is_booked_by_the_sweeper() {
        let f = fixture().await;
        let hold = hold(&f).await;
        // Simulate a finalizer that claimed the hold and then crashed.
        assert!(f
            .holds
            .transition(hold.hold_id, HoldState::Active, HoldState::Finalized)
            .await
            .unwrap());

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(report.seats_released, 0);
        for seat in f.seats.get_many(&f.keys).await.unwrap() {
            assert_eq!(seat.status, SeatStatus::Booked { hold_id: hold.hold_id });
        }
    }

    #[tokio::test]
    async fn confirmed_hold_is_not_reverted() {
        let f = fixture().await;
        let hold = hold(&f).await;
        let finalizer = BookingFinalizer::new(
            f.seats.clone(),
            f.holds.clone(),
            f.clock.clone(),
            f.events.clone(),
        );
        finalizer.confirm(hold.hold_id).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(10));

        assert!(f.sweeper.sweep_once().await.unwrap().is_idle());
        for seat in f.seats.get_many(&f.keys).await.unwrap() {
            assert_eq!(seat.status, SeatStatus::Booked { hold_id: hold.hold_id });
        }
    }

    #[tokio::test]
    async fn settled_holds_are_pruned_after_retention() {
        let f = fixture().await;
        let hold = hold(&f).await;
        f.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(f.sweeper.sweep_once().await.unwrap().pruned, 0);
        assert!(f.holds.get(hold.hold_id).await.unwrap().is_some());

        f.clock.advance(chrono::Duration::hours(25));
        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(f.holds.get(hold.hold_id).await.unwrap().is_none());
    }

    /// Hold store whose settlement bookkeeping always fails.
    struct BrokenSettle(Arc<InMemoryHoldStore>);

    #[async_trait::async_trait]
    impl HoldStore for BrokenSettle {
        async fn insert(&self, hold: &Hold) -> stalls_core::StoreResult<()> {
            self.0.insert(hold).await
        }

        async fn get(&self, hold_id: stalls_core::HoldId) -> stalls_core::StoreResult<Option<Hold>> {
            self.0.get(hold_id).await
        }

        async fn transition(
            &self,
            hold_id: stalls_core::HoldId,
            from: HoldState,
            to: HoldState,
        ) -> stalls_core::StoreResult<bool> {
            self.0.transition(hold_id, from, to).await
        }

        async fn mark_settled(&self, _hold_id: stalls_core::HoldId) -> stalls_core::StoreResult<()> {
            Err(StoreError::Unavailable("settle index down".into()))
        }

        async fn discard(&self, hold_id: stalls_core::HoldId) -> stalls_core::StoreResult<()> {
            self.0.discard(hold_id).await
        }

        async fn due_for_sweep(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> stalls_core::StoreResult<Vec<Hold>> {
            self.0.due_for_sweep(now, limit).await
        }
    }

    #[tokio::test]
    async fn expiry_is_announced_even_if_settled_flag_fails() {
        let f = fixture().await;
        let sweeper = HoldSweeper::new(
            f.seats.clone(),
            Arc::new(BrokenSettle(f.holds.clone())),
            f.clock.clone(),
            f.events.clone(),
            100,
        );
        let mut events = f.events.subscribe();
        let hold = hold(&f).await;
        f.clock.advance(chrono::Duration::seconds(1));

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.settled, 0);
        assert_eq!(report.errors, 1);

        assert_eq!(events.recv().await.unwrap().name(), "hold_created");
        assert_eq!(
            events.recv().await.unwrap(),
            ReservationEvent::HoldExpired {
                hold_id: hold.hold_id,
                seat_keys: f.keys.clone()
            }
        );
        let stored = f.holds.get(hold.hold_id).await.unwrap().unwrap();
        assert_eq!(stored.state, HoldState::Expired);
        assert!(!stored.settled);

        // A later pass with working bookkeeping finishes without announcing twice.
        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(report.expired, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_sweeper_stops_on_shutdown() {
        let f = fixture().await;
        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(f.sweeper).spawn(Duration::from_secs(10), rx);

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
