use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use stalls_core::{LockError, ScopedLock, SeatKey, SeatLock, SeatLocks};

use crate::redis_repo::RedisClient;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Distributed seat locks for multi-instance deployments.
///
/// Each lock is a `SET NX PX` key holding a random owner token. The TTL bounds
/// how long a crashed owner can keep a seat locked; release only deletes the
/// key if it still carries the caller's token.
#[derive(Clone)]
pub struct RedisSeatLocks {
    redis: RedisClient,
    ttl: Duration,
}

impl RedisSeatLocks {
    pub fn new(redis: RedisClient, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    async fn try_acquire(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self
            .redis
            .connection()
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        // SET NX: Only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        Ok(result.is_some())
    }
}

#[async_trait]
impl SeatLocks for RedisSeatLocks {
    async fn lock(&self, seat_key: &SeatKey, deadline: Instant) -> Result<ScopedLock, LockError> {
        let key = self.redis.seat_lock_key(seat_key);
        let token = Uuid::new_v4().to_string();

        loop {
            if self.try_acquire(&key, &token).await? {
                debug!(seat = %seat_key, "Redis seat lock acquired");
                return Ok(Box::new(RedisLock {
                    client: self.redis.client().clone(),
                    seat_key: seat_key.clone(),
                    key,
                    token,
                    released: false,
                }));
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(LockError::Timeout(seat_key.clone()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

struct RedisLock {
    client: redis::Client,
    seat_key: SeatKey,
    key: String,
    token: String,
    released: bool,
}

async fn release(client: redis::Client, key: String, token: String) {
    let outcome: Result<i64, redis::RedisError> = async {
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(&token)
            .invoke_async(&mut conn)
            .await
    }
    .await;

    match outcome {
        Ok(0) => warn!(key = %key, "Seat lock had already expired before release"),
        Ok(_) => debug!(key = %key, "Redis seat lock released"),
        // The TTL releases it eventually.
        Err(e) => warn!(key = %key, error = %e, "Failed to release Redis seat lock"),
    }
}

#[async_trait]
impl SeatLock for RedisLock {
    fn seat_key(&self) -> &SeatKey {
        &self.seat_key
    }

    async fn unlock(self: Box<Self>) {
        let mut lock = self;
        lock.released = true;
        let key = std::mem::take(&mut lock.key);
        let token = std::mem::take(&mut lock.token);
        release(lock.client.clone(), key, token).await;
    }
}

impl Drop for RedisLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let client = self.client.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release(client, key, token));
            }
            Err(_) => warn!(key = %key, "No runtime to release dropped seat lock; waiting for TTL"),
        }
    }
}
