pub mod app_config;
pub mod memory;
pub mod memory_locks;
pub mod redis_locks;
pub mod redis_repo;

pub use app_config::{Config, StoreBackend};
pub use memory::{InMemoryHoldStore, InMemorySeatStore};
pub use memory_locks::InMemorySeatLocks;
pub use redis_locks::RedisSeatLocks;
pub use redis_repo::{RedisClient, RedisHoldStore, RedisSeatStore};
