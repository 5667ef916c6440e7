use serde::Deserialize;
use std::time::Duration;
use tripwire_checker::worker::CheckerConfig;
use tripwire_notify::delivery::DeliveryConfig;
use tripwire_notify::notifier::NotifierConfig;
use tripwire_notify::registry::SenderConfig;
use tripwire_notify::throttling::ThrottlingConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub id: IdConfig,
    #[serde(default)]
    pub checker: CheckerSection,
    #[serde(default)]
    pub throttling: ThrottlingSection,
    #[serde(default)]
    pub notifier: NotifierSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub senders: Vec<SenderConfig>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{path}': {e}"))?;
        let config = Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{path}': {e}"))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.trim().is_empty() {
            anyhow::bail!("storage.path must be set for the sqlite backend");
        }
        tripwire_common::id::validate(self.id.machine_id, self.id.node_id)?;
        if self.checker.workers == 0 || self.delivery.workers == 0 {
            anyhow::bail!("checker.workers and delivery.workers must be at least 1");
        }
        if self.checker.lock_lease_secs == 0 {
            anyhow::bail!("checker.lock_lease_secs must be at least 1");
        }
        if self.delivery.max_attempts == 0 {
            anyhow::bail!("delivery.max_attempts must be at least 1");
        }
        if self.delivery.batch_size == 0 {
            anyhow::bail!("delivery.batch_size must be at least 1");
        }
        if self.delivery.claim_timeout_secs == 0 {
            anyhow::bail!("delivery.claim_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// SQLite database file. Every process of a deployment points at the
    /// same file.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_storage_path(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_storage_path() -> String {
    "data/tripwire.db".to_string()
}

/// Snowflake generator identity. Must be unique per process.
#[derive(Debug, Clone, Deserialize)]
pub struct IdConfig {
    #[serde(default = "default_one")]
    pub machine_id: i32,
    #[serde(default = "default_one")]
    pub node_id: i32,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            machine_id: default_one(),
            node_id: default_one(),
        }
    }
}

fn default_one() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckerSection {
    #[serde(default = "default_checker_workers")]
    pub workers: usize,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

impl Default for CheckerSection {
    fn default() -> Self {
        Self {
            workers: default_checker_workers(),
            check_interval_secs: default_check_interval_secs(),
            lock_lease_secs: default_lock_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl CheckerSection {
    pub fn to_checker_config(&self) -> CheckerConfig {
        CheckerConfig {
            workers: self.workers,
            check_interval: Duration::from_secs(self.check_interval_secs),
            lock_lease: chrono_secs(self.lock_lease_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}

fn default_checker_workers() -> usize {
    4
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_lock_lease_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_error_backoff_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottlingSection {
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
}

impl Default for ThrottlingSection {
    fn default() -> Self {
        Self {
            lookback_secs: default_lookback_secs(),
            threshold: default_threshold(),
            base_interval_secs: default_base_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

impl ThrottlingSection {
    pub fn to_throttling_config(&self) -> ThrottlingConfig {
        ThrottlingConfig {
            lookback: chrono_secs(self.lookback_secs),
            threshold: self.threshold,
            base_interval: chrono_secs(self.base_interval_secs),
            max_interval: chrono_secs(self.max_interval_secs),
        }
    }
}

fn default_lookback_secs() -> u64 {
    600
}

fn default_threshold() -> u64 {
    3
}

fn default_base_interval_secs() -> u64 {
    300
}

fn default_max_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl NotifierSection {
    pub fn to_notifier_config(&self) -> NotifierConfig {
        NotifierConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            visibility_timeout: chrono_secs(self.visibility_timeout_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}

fn default_visibility_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    #[serde(default = "default_delivery_workers")]
    pub workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: u64,
    #[serde(default = "default_delivery_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_fast_poll_interval_ms")]
    pub fast_poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Must exceed the slowest sender's timeout.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            workers: default_delivery_workers(),
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            high_water_mark: default_high_water_mark(),
            poll_interval_ms: default_delivery_poll_interval_ms(),
            fast_poll_interval_ms: default_fast_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl DeliverySection {
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            workers: self.workers,
            max_workers: self.max_workers,
            batch_size: self.batch_size,
            high_water_mark: self.high_water_mark,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            fast_poll_interval: Duration::from_millis(self.fast_poll_interval_ms),
            max_attempts: self.max_attempts,
            backoff_base: chrono_secs(self.backoff_base_secs),
            backoff_max: chrono_secs(self.backoff_max_secs),
            claim_timeout: chrono_secs(self.claim_timeout_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}

fn default_claim_timeout_secs() -> u64 {
    60
}

fn default_delivery_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    8
}

fn default_batch_size() -> usize {
    50
}

fn default_high_water_mark() -> u64 {
    200
}

fn default_delivery_poll_interval_ms() -> u64 {
    1000
}

fn default_fast_poll_interval_ms() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_backoff_max_secs() -> u64 {
    600
}

/// Longest configurable duration, so timestamp arithmetic cannot overflow.
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}
