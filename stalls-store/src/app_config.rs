use serde::Deserialize;
use stalls_core::LockingStrategy;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub sweeper: SweeperConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategy: LockingStrategy,
    pub lease_seconds: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_lock_timeout_ms() -> u64 { 2_000 }
fn default_max_attempts() -> usize { 3 }
fn default_backoff_initial_ms() -> u64 { 20 }
fn default_backoff_max_ms() -> u64 { 500 }

impl EngineConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    pub interval_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long settled holds stay readable before they are deleted.
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
}

fn default_batch_size() -> usize { 500 }
fn default_retention_seconds() -> u64 { 86_400 }

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_lock_ttl_ms() -> u64 { 10_000 }
fn default_key_prefix() -> String { "stalls:".to_string() }

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            lock_ttl_ms: default_lock_ttl_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg.. `STALLS_ENGINE__STRATEGY=optimistic` sets `engine.strategy`
            .add_source(config::Environment::with_prefix("STALLS").separator("__"))
            .build()?;

        let config: Config = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document. Used by tests and embedders that bring their own file.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.strategy == LockingStrategy::ThreadLocal {
            return Err(ConfigError::Invalid(
                "engine.strategy = thread_local is not supported: process-local lock maps do not \
                 exclude other instances; use pessimistic or optimistic"
                    .into(),
            ));
        }
        if self.engine.lease_seconds == 0 {
            return Err(ConfigError::Invalid("engine.lease_seconds must be positive".into()));
        }
        if self.engine.max_attempts == 0 {
            return Err(ConfigError::Invalid("engine.max_attempts must be at least 1".into()));
        }
        if self.sweeper.interval_seconds == 0 {
            return Err(ConfigError::Invalid("sweeper.interval_seconds must be positive".into()));
        }
        if self.sweeper.interval_seconds >= self.engine.lease_seconds {
            return Err(ConfigError::Invalid(format!(
                "sweeper.interval_seconds ({}) must be shorter than engine.lease_seconds ({})",
                self.sweeper.interval_seconds, self.engine.lease_seconds
            )));
        }
        if self.sweeper.retention_seconds == 0 {
            return Err(ConfigError::Invalid("sweeper.retention_seconds must be positive".into()));
        }
        Ok(())
    }
}
