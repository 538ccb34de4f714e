mod common;

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use stalls_core::{
    ClaimantId, Clock, FinalizeError, LockingStrategy, ManualClock, ReservationError, SeatStatus,
    ShowId,
};
use stalls_engine::{LockCoordinator, ReservationEngine, RetryPolicy};
use stalls_store::InMemorySeatLocks;

use common::{init_tracing, seats};

const STRATEGIES: [LockingStrategy; 2] = [LockingStrategy::Pessimistic, LockingStrategy::Optimistic];

fn engine(strategy: LockingStrategy) -> Arc<ReservationEngine> {
    Arc::new(
        ReservationEngine::builder()
            .strategy(strategy)
            .lock_timeout(Duration::from_secs(10))
            .build()
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn exactly_one_of_fifty_claimants_gets_the_seat() {
    init_tracing();
    for strategy in STRATEGIES {
        let engine = engine(strategy);
        let keys = seats(ShowId::new(), &["A1"]);
        engine.provision(&keys).await.unwrap();

        let attempts = (0..50).map(|i| {
            let engine = engine.clone();
            let keys = keys.clone();
            tokio::spawn(async move {
                engine
                    .reserve(ClaimantId::new(format!("c{i}")), &keys, Duration::from_secs(300))
                    .await
            })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "{strategy:?}");
        for loser in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(
                    loser,
                    ReservationError::SeatUnavailable { .. } | ReservationError::ConcurrentModification
                ),
                "{strategy:?}: unexpected {loser:?}"
            );
        }

        let seat = &engine.seat_status(&keys).await.unwrap()[0];
        assert!(seat.status.is_held_by(winners[0].hold_id));
        assert_eq!(seat.version, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn overlapping_multi_seat_claims_never_share_a_seat() {
    init_tracing();
    for strategy in STRATEGIES {
        let engine = engine(strategy);
        let show = ShowId::new();
        let all = seats(show, &["A1", "A2", "A3", "A4"]);
        engine.provision(&all).await.unwrap();

        // Each request overlaps its neighbours, half in reverse order.
        let attempts = (0..60).map(|i| {
            let engine = engine.clone();
            let mut keys = vec![all[i % 4].clone(), all[(i + 1) % 4].clone()];
            if i % 2 == 1 {
                keys.reverse();
            }
            tokio::spawn(async move {
                engine
                    .reserve(ClaimantId::new(format!("c{i}")), &keys, Duration::from_secs(300))
                    .await
            })
        });

        let finished = tokio::time::timeout(Duration::from_secs(20), join_all(attempts))
            .await
            .expect("claims deadlocked");
        let holds: Vec<_> = finished
            .into_iter()
            .filter_map(|r| r.unwrap().ok())
            .collect();
        assert!(!holds.is_empty());

        let mut claimed: Vec<_> = holds.iter().flat_map(|h| h.seat_keys.clone()).collect();
        let total = claimed.len();
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), total, "{strategy:?}: a seat was allocated twice");

        for seat in engine.seat_status(&all).await.unwrap() {
            match seat.status {
                SeatStatus::Held { hold_id, .. } => {
                    let owner = holds.iter().find(|h| h.hold_id == hold_id).unwrap();
                    assert!(owner.seat_keys.contains(&seat.key));
                }
                SeatStatus::Available => {
                    assert!(!claimed.contains(&seat.key));
                }
                SeatStatus::Booked { .. } => panic!("nothing was confirmed"),
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn optimistic_losers_without_retries_leave_no_partial_claims() {
    let engine = Arc::new(
        ReservationEngine::builder()
            .strategy(LockingStrategy::Optimistic)
            .retry(RetryPolicy::none())
            .build()
            .unwrap(),
    );
    let keys = seats(ShowId::new(), &["A1", "A2", "A3", "A4", "A5", "A6"]);
    engine.provision(&keys).await.unwrap();

    let attempts = (0..50).map(|i| {
        let engine = engine.clone();
        let keys = keys.clone();
        tokio::spawn(async move {
            engine
                .reserve(ClaimantId::new(format!("c{i}")), &keys, Duration::from_secs(300))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    // Without retries every claimant may lose to someone else's partial claim,
    // but whatever the outcome no seat is left half claimed.
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert!(winners.len() <= 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(
                err,
                ReservationError::SeatUnavailable { .. } | ReservationError::ConcurrentModification
            ),
            "unexpected {err:?}"
        );
    }

    // Rollbacks run inline, so by now only a winner's seats are held.
    for seat in engine.seat_status(&keys).await.unwrap() {
        match winners.first() {
            Some(winner) => assert!(seat.status.is_held_by(winner.hold_id)),
            None => assert_eq!(seat.status, SeatStatus::Available),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirm_racing_a_sweep_never_splits_a_hold() {
    init_tracing();
    for round in 0..50 {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = Arc::new(
            ReservationEngine::builder()
                .strategy(STRATEGIES[round % 2])
                .clock(clock.clone())
                .build()
                .unwrap(),
        );
        let keys = seats(ShowId::new(), &["A1", "A2", "A3"]);
        engine.provision(&keys).await.unwrap();
        let hold = engine
            .reserve(ClaimantId::new("x"), &keys, Duration::from_secs(60))
            .await
            .unwrap();

        let sweeper = engine.sweeper();
        let late = clock.now() + chrono::Duration::minutes(5);
        let sweep = tokio::spawn(async move { sweeper.sweep_at(late).await });
        let hold_id = hold.hold_id;
        let confirm = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.confirm(hold_id).await })
        };

        let confirmed = confirm.await.unwrap();
        sweep.await.unwrap().unwrap();
        let statuses: Vec<_> = engine
            .seat_status(&keys)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.status)
            .collect();

        match confirmed {
            Ok(_) => {
                for status in statuses {
                    assert_eq!(status, SeatStatus::Booked { hold_id: hold.hold_id });
                }
            }
            Err(err) => {
                assert!(matches!(err, FinalizeError::HoldExpired { .. }), "{err:?}");
                for status in statuses {
                    assert_eq!(status, SeatStatus::Available);
                }
            }
        }
    }
}

#[tokio::test]
async fn abandoned_pessimistic_claim_releases_its_locks() {
    let locks = Arc::new(InMemorySeatLocks::new());
    let engine = ReservationEngine::builder()
        .strategy(LockingStrategy::Pessimistic)
        .locks(locks.clone())
        .lock_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let keys = seats(ShowId::new(), &["A1", "A2"]);
    engine.provision(&keys).await.unwrap();

    // Someone else sits on A2, so the claim below stops holding A1.
    let outsider = LockCoordinator::new(locks, Duration::from_secs(1));
    let mut blocker = outsider.acquire_all(&keys[1..]).await.unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        engine.reserve(ClaimantId::new("y"), &keys, Duration::from_secs(300)),
    )
    .await;
    assert!(abandoned.is_err());
    blocker.release_all().await;

    let hold = tokio::time::timeout(
        Duration::from_secs(1),
        engine.reserve(ClaimantId::new("z"), &keys, Duration::from_secs(300)),
    )
    .await
    .expect("a lock leaked")
    .unwrap();
    assert_eq!(hold.seat_keys, keys);
}
