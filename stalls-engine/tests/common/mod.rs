#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stalls_core::{Seat, SeatKey, SeatStore, SeatTransition, ShowId, StoreError, StoreResult};
use stalls_store::InMemorySeatStore;

type Predicate = Box<dyn Fn(&SeatTransition) -> bool + Send + Sync>;

/// Seat store that can fail or stall selected `compare_and_set` calls.
#[derive(Default)]
pub struct FlakySeatStore {
    inner: InMemorySeatStore,
    fail: Mutex<Option<Predicate>>,
    slow: Mutex<Option<(Predicate, Duration)>>,
}

impl FlakySeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when(&self, predicate: impl Fn(&SeatTransition) -> bool + Send + Sync + 'static) {
        *self.fail.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn stall_when(
        &self,
        delay: Duration,
        predicate: impl Fn(&SeatTransition) -> bool + Send + Sync + 'static,
    ) {
        *self.slow.lock().unwrap() = Some((Box::new(predicate), delay));
    }

    pub fn heal(&self) {
        *self.fail.lock().unwrap() = None;
        *self.slow.lock().unwrap() = None;
    }
}

#[async_trait]
impl SeatStore for FlakySeatStore {
    async fn provision(&self, seat_keys: &[SeatKey]) -> StoreResult<usize> {
        self.inner.provision(seat_keys).await
    }

    async fn get(&self, seat_key: &SeatKey) -> StoreResult<Seat> {
        self.inner.get(seat_key).await
    }

    async fn get_many(&self, seat_keys: &[SeatKey]) -> StoreResult<Vec<Seat>> {
        self.inner.get_many(seat_keys).await
    }

    async fn compare_and_set(&self, transition: &SeatTransition) -> StoreResult<bool> {
        let delay = {
            let slow = self.slow.lock().unwrap();
            slow.as_ref().filter(|(p, _)| p(transition)).map(|(_, d)| *d)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.fail.lock().unwrap().as_ref().is_some_and(|p| p(transition));
        if failing {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.inner.compare_and_set(transition).await
    }
}

pub fn seats(show: ShowId, labels: &[&str]) -> Vec<SeatKey> {
    labels.iter().map(|l| SeatKey::new(show, *l)).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stalls_engine=warn".into()),
        )
        .with_test_writer()
        .try_init();
}
