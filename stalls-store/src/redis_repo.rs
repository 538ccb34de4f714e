use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::{debug, warn};

use stalls_core::store::check_transition;
use stalls_core::{
    Hold, HoldId, HoldState, HoldStore, Seat, SeatKey, SeatStatus, SeatStore, SeatTransition,
    StoreError, StoreResult,
};

const SEAT_CAS_SCRIPT: &str = r#"
    local current = redis.call("HGET", KEYS[1], "version")
    if not current then
        return -1
    end
    if current ~= ARGV[1] then
        return 0
    end
    redis.call("HSET", KEYS[1], "version", ARGV[2], "status", ARGV[3])
    return 1
"#;

const SEAT_PROVISION_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return 0
    end
    redis.call("HSET", KEYS[1], "version", "0", "status", ARGV[1])
    return 1
"#;

const HOLD_TRANSITION_SCRIPT: &str = r#"
    local state = redis.call("HGET", KEYS[1], "state")
    if not state then
        return -1
    end
    if state ~= ARGV[1] then
        return 0
    end
    redis.call("HSET", KEYS[1], "state", ARGV[2])
    if ARGV[4] == "1" then
        redis.call("PERSIST", KEYS[1])
        redis.call("HSET", KEYS[1], "settled", "0")
        redis.call("ZREM", KEYS[2], ARGV[3])
        redis.call("SADD", KEYS[3], ARGV[3])
    end
    return 1
"#;

const HOLD_SETTLE_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 0 then
        return -1
    end
    redis.call("HSET", KEYS[1], "settled", "1")
    redis.call("SREM", KEYS[2], ARGV[1])
    if tonumber(ARGV[2]) > 0 then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
    end
    return 1
"#;

pub(crate) fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Shared Redis handle with the key layout used by every Redis-backed store.
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    prefix: String,
}

impl RedisClient {
    pub fn new(connection_string: &str, prefix: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    pub(crate) async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    pub(crate) fn client(&self) -> &redis::Client {
        &self.client
    }

    pub fn seat_key(&self, key: &SeatKey) -> String {
        format!("{}seat:{}:{}", self.prefix, key.show_id, key.seat)
    }

    pub fn seat_lock_key(&self, key: &SeatKey) -> String {
        format!("{}seatlock:{}:{}", self.prefix, key.show_id, key.seat)
    }

    pub fn hold_key(&self, hold_id: HoldId) -> String {
        format!("{}hold:{}", self.prefix, hold_id)
    }

    pub fn active_holds_key(&self) -> String {
        format!("{}holds:active", self.prefix)
    }

    pub fn unsettled_holds_key(&self) -> String {
        format!("{}holds:unsettled", self.prefix)
    }
}

fn encode_status(status: &SeatStatus) -> StoreResult<String> {
    serde_json::to_string(status).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode_seat(key: &SeatKey, version: Option<String>, status: Option<String>) -> StoreResult<Seat> {
    let (Some(version), Some(status)) = (version, status) else {
        return Err(StoreError::NotFound(key.clone()));
    };
    let version = version
        .parse::<u64>()
        .map_err(|e| StoreError::Corrupt(format!("seat {} version: {}", key, e)))?;
    let status = serde_json::from_str(&status)
        .map_err(|e| StoreError::Corrupt(format!("seat {} status: {}", key, e)))?;
    Ok(Seat {
        key: key.clone(),
        status,
        version,
    })
}

/// Seat store backed by one Redis hash per seat; CAS runs as a Lua script.
#[derive(Clone)]
pub struct RedisSeatStore {
    redis: RedisClient,
}

impl RedisSeatStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl SeatStore for RedisSeatStore {
    async fn provision(&self, seat_keys: &[SeatKey]) -> StoreResult<usize> {
        let mut conn = self.redis.connection().await?;
        let script = redis::Script::new(SEAT_PROVISION_SCRIPT);
        let status = encode_status(&SeatStatus::Available)?;

        let mut created = 0;
        for key in seat_keys {
            let inserted: i64 = script
                .key(self.redis.seat_key(key))
                .arg(&status)
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            created += inserted as usize;
        }
        debug!(requested = seat_keys.len(), created, "Provisioned seats in Redis");
        Ok(created)
    }

    async fn get(&self, seat_key: &SeatKey) -> StoreResult<Seat> {
        let mut seats = self.get_many(std::slice::from_ref(seat_key)).await?;
        seats.pop().ok_or_else(|| StoreError::NotFound(seat_key.clone()))
    }

    async fn get_many(&self, seat_keys: &[SeatKey]) -> StoreResult<Vec<Seat>> {
        let mut conn = self.redis.connection().await?;
        let mut pipe = redis::pipe();
        for key in seat_keys {
            pipe.cmd("HMGET")
                .arg(self.redis.seat_key(key))
                .arg("version")
                .arg("status");
        }
        let rows: Vec<(Option<String>, Option<String>)> =
            pipe.query_async(&mut conn).await.map_err(unavailable)?;

        seat_keys
            .iter()
            .zip(rows)
            .map(|(key, (version, status))| decode_seat(key, version, status))
            .collect()
    }

    async fn compare_and_set(&self, transition: &SeatTransition) -> StoreResult<bool> {
        check_transition(transition)?;
        let mut conn = self.redis.connection().await?;
        let outcome: i64 = redis::Script::new(SEAT_CAS_SCRIPT)
            .key(self.redis.seat_key(&transition.key))
            .arg(transition.expected_version.to_string())
            .arg(transition.new_version.to_string())
            .arg(encode_status(&transition.status)?)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match outcome {
            -1 => Err(StoreError::NotFound(transition.key.clone())),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}

/// Hold store backed by one Redis hash per hold plus two indexes: a sorted
/// set of active holds scored by lease expiry, and a set of unsettled holds.
///
/// Settled holds expire through a key TTL once a retention is set.
#[derive(Clone)]
pub struct RedisHoldStore {
    redis: RedisClient,
    retention: Option<Duration>,
}

impl RedisHoldStore {
    pub fn new(redis: RedisClient) -> Self {
        Self {
            redis,
            retention: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention).filter(|r| !r.is_zero());
        self
    }

    async fn load(&self, conn: &mut MultiplexedConnection, hold_id: HoldId) -> StoreResult<Option<Hold>> {
        let (record, state, settled): (Option<String>, Option<String>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.redis.hold_key(hold_id))
                .arg("record")
                .arg("state")
                .arg("settled")
                .query_async(conn)
                .await
                .map_err(unavailable)?;

        let (Some(record), Some(state)) = (record, state) else {
            return Ok(None);
        };
        let mut hold: Hold = serde_json::from_str(&record)
            .map_err(|e| StoreError::Corrupt(format!("hold {}: {}", hold_id, e)))?;
        hold.state = HoldState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("hold {} state {}", hold_id, state)))?;
        hold.settled = settled.as_deref() == Some("1");
        Ok(Some(hold))
    }
}

#[async_trait]
impl HoldStore for RedisHoldStore {
    async fn insert(&self, hold: &Hold) -> StoreResult<()> {
        let mut conn = self.redis.connection().await?;
        let record = serde_json::to_string(hold).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let id = hold.hold_id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.redis.hold_key(hold.hold_id))
            .arg("record")
            .arg(record)
            .arg("state")
            .arg(hold.state.as_str())
            .arg("settled")
            .arg(if hold.settled { "1" } else { "0" })
            .ignore();
        if hold.is_active() {
            pipe.cmd("ZADD")
                .arg(self.redis.active_holds_key())
                .arg(hold.expires_at.timestamp_millis())
                .arg(&id)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, hold_id: HoldId) -> StoreResult<Option<Hold>> {
        let mut conn = self.redis.connection().await?;
        self.load(&mut conn, hold_id).await
    }

    async fn transition(
        &self,
        hold_id: HoldId,
        from: HoldState,
        to: HoldState,
    ) -> StoreResult<bool> {
        let mut conn = self.redis.connection().await?;
        let outcome: i64 = redis::Script::new(HOLD_TRANSITION_SCRIPT)
            .key(self.redis.hold_key(hold_id))
            .key(self.redis.active_holds_key())
            .key(self.redis.unsettled_holds_key())
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(hold_id.to_string())
            .arg(if to.is_terminal() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match outcome {
            -1 => Err(StoreError::HoldNotFound(hold_id)),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn mark_settled(&self, hold_id: HoldId) -> StoreResult<()> {
        let mut conn = self.redis.connection().await?;
        let outcome: i64 = redis::Script::new(HOLD_SETTLE_SCRIPT)
            .key(self.redis.hold_key(hold_id))
            .key(self.redis.unsettled_holds_key())
            .arg(hold_id.to_string())
            .arg(self.retention.map_or(0, |r| r.as_millis() as u64))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if outcome == -1 {
            return Err(StoreError::HoldNotFound(hold_id));
        }
        Ok(())
    }

    async fn discard(&self, hold_id: HoldId) -> StoreResult<()> {
        let mut conn = self.redis.connection().await?;
        let id = hold_id.to_string();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.redis.hold_key(hold_id))
            .ignore()
            .cmd("ZREM")
            .arg(self.redis.active_holds_key())
            .arg(&id)
            .ignore()
            .cmd("SREM")
            .arg(self.redis.unsettled_holds_key())
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn due_for_sweep(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Hold>> {
        let mut conn = self.redis.connection().await?;

        let mut ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.redis.active_holds_key())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if ids.len() < limit {
            let unsettled: Vec<String> = redis::cmd("SRANDMEMBER")
                .arg(self.redis.unsettled_holds_key())
                .arg(limit - ids.len())
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            ids.extend(unsettled);
        }

        let mut holds = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
                warn!(hold_id = %id, "Skipping malformed hold id in sweep index");
                continue;
            };
            if let Some(hold) = self.load(&mut conn, HoldId::from_uuid(uuid)).await? {
                holds.push(hold);
            }
        }
        Ok(holds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stalls_core::{ClaimantId, ShowId};

    #[test]
    fn keys_carry_prefix_and_seat_identity() {
        let redis = RedisClient::new("redis://127.0.0.1/", "stalls:").unwrap();
        let show = ShowId::new();
        let key = SeatKey::new(show, "A1");

        assert_eq!(redis.seat_key(&key), format!("stalls:seat:{}:A1", show));
        assert_eq!(redis.seat_lock_key(&key), format!("stalls:seatlock:{}:A1", show));
        assert_eq!(redis.active_holds_key(), "stalls:holds:active");
    }

    #[test]
    fn decode_seat_treats_missing_fields_as_not_found() {
        let key = SeatKey::new(ShowId::new(), "A1");
        assert_eq!(
            decode_seat(&key, None, None),
            Err(StoreError::NotFound(key.clone()))
        );

        let status = encode_status(&SeatStatus::Available).unwrap();
        let seat = decode_seat(&key, Some("3".into()), Some(status)).unwrap();
        assert_eq!(seat.version, 3);
        assert!(seat.status.is_available());

        assert!(matches!(
            decode_seat(&key, Some("x".into()), Some("{}".into())),
            Err(StoreError::Corrupt(_))
        ));
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (REDIS_URL)"]
    async fn redis_seat_cas_round_trip() {
        let prefix = format!("test:{}:", uuid::Uuid::new_v4());
        let store = RedisSeatStore::new(RedisClient::new(&redis_url(), &prefix).unwrap());
        let key = SeatKey::new(ShowId::new(), "A1");

        assert_eq!(store.provision(std::slice::from_ref(&key)).await.unwrap(), 1);
        let seat = store.get(&key).await.unwrap();
        let t = seat.transition_to(SeatStatus::Booked { hold_id: HoldId::new() });
        assert!(store.compare_and_set(&t).await.unwrap());
        assert!(!store.compare_and_set(&t).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().version, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (REDIS_URL)"]
    async fn redis_hold_sweep_index_tracks_state() {
        let prefix = format!("test:{}:", uuid::Uuid::new_v4());
        let store = RedisHoldStore::new(RedisClient::new(&redis_url(), &prefix).unwrap());
        let now = Utc::now();
        let hold = Hold::new(
            ClaimantId::new("u"),
            vec![SeatKey::new(ShowId::new(), "A1")],
            now,
            now - chrono::Duration::seconds(1),
        );
        store.insert(&hold).await.unwrap();

        let due = store.due_for_sweep(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(store
            .transition(hold.hold_id, HoldState::Active, HoldState::Expired)
            .await
            .unwrap());
        let due = store.due_for_sweep(now, 10).await.unwrap();
        assert_eq!(due[0].state, HoldState::Expired);

        store.mark_settled(hold.hold_id).await.unwrap();
        assert!(store.due_for_sweep(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (REDIS_URL)"]
    async fn redis_settled_hold_gets_a_ttl() {
        let prefix = format!("test:{}:", uuid::Uuid::new_v4());
        let redis = RedisClient::new(&redis_url(), &prefix).unwrap();
        let store = RedisHoldStore::new(redis.clone()).with_retention(Duration::from_secs(60));
        let now = Utc::now();
        let hold = Hold::new(ClaimantId::new("u"), vec![], now, now);
        store.insert(&hold).await.unwrap();
        store
            .transition(hold.hold_id, HoldState::Active, HoldState::Released)
            .await
            .unwrap();

        let mut conn = redis.connection().await.unwrap();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(redis.hold_key(hold.hold_id))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(ttl, -1);

        store.mark_settled(hold.hold_id).await.unwrap();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(redis.hold_key(hold.hold_id))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(ttl > 0 && ttl <= 60_000);
    }
}
