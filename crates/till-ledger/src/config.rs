//! # Ledger Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TILL_DATABASE_PATH=/var/lib/till/ledger.db                         │
//! │     TILL_AUTO_OPEN_POLICY=reject                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/till-ledger/ledger.toml (Linux)                          │
//! │     ~/Library/Application Support/com.till.ledger/ledger.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "till.db"
//! max_connections = 5
//!
//! [ledger]
//! business_utc_offset_minutes = 300
//! auto_open_policy = "open"   # open | reject
//! history_limit = 50
//!
//! [idempotency]
//! backend = "sqlite"          # memory | sqlite | redis
//! lock_ttl_secs = 60
//! processed_ttl_secs = 86400
//!
//! [analytics]
//! cost_basis_policy = "latest_batch"
//! high_avg_transaction_threshold = 50000000
//! recompute_on_event = true
//!
//! [scheduler]
//! enabled = true
//! interval_secs = 3600
//! lookback_days = 2
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};
use till_core::summary::{AnomalyThresholds, CostBasisPolicy};
use till_core::{Money, DEFAULT_HISTORY_LIMIT, DEFAULT_LOCK_TTL_SECS, DEFAULT_PROCESSED_TTL_SECS};

// =============================================================================
// Policies
// =============================================================================

/// What to do with a cash sale when no shift is open for its day.
///
/// ```text
/// OPEN (Default)                     │  REJECT
/// ──────────────                     │  ──────
/// • Opens a shift with target 0      │  • Fails with ShiftClosed
/// • Logs a warning                   │  • Event can be retried after
/// • Cash is never lost               │    someone opens the shift
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoOpenPolicy {
    #[default]
    Open,
    Reject,
}

impl std::fmt::Display for AutoOpenPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutoOpenPolicy::Open => write!(f, "open"),
            AutoOpenPolicy::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for AutoOpenPolicy {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" | "auto" => Ok(AutoOpenPolicy::Open),
            "reject" | "strict" => Ok(AutoOpenPolicy::Reject),
            other => Err(ServiceError::InvalidConfig(format!(
                "Unknown auto-open policy: '{}'. Valid options: open, reject",
                other
            ))),
        }
    }
}

/// Where idempotency locks and markers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardBackend {
    /// Process-local. Lost on restart.
    Memory,
    /// The ledger database.
    #[default]
    Sqlite,
    /// A shared Redis (feature `redis-guard`).
    Redis,
}

impl std::fmt::Display for GuardBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardBackend::Memory => write!(f, "memory"),
            GuardBackend::Sqlite => write!(f, "sqlite"),
            GuardBackend::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for GuardBackend {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(GuardBackend::Memory),
            "sqlite" | "db" => Ok(GuardBackend::Sqlite),
            "redis" => Ok(GuardBackend::Redis),
            other => Err(ServiceError::InvalidConfig(format!(
                "Unknown idempotency backend: '{}'. Valid options: memory, sqlite, redis",
                other
            ))),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. `:memory:` for a throwaway database.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("till.db")
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Ledger Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Offset of the business timezone from UTC, in minutes. Decides which
    /// calendar day a sale or shift belongs to.
    #[serde(default)]
    pub business_utc_offset_minutes: i32,

    #[serde(default)]
    pub auto_open_policy: AutoOpenPolicy,

    /// Rows returned by `history` when the caller gives no limit.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

fn default_history_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            business_utc_offset_minutes: 0,
            auto_open_policy: AutoOpenPolicy::default(),
            history_limit: default_history_limit(),
        }
    }
}

// =============================================================================
// Idempotency Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default)]
    pub backend: GuardBackend,

    /// Lifetime of an in-flight lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Lifetime of a processed marker.
    #[serde(default = "default_processed_ttl")]
    pub processed_ttl_secs: u64,

    /// Required when `backend = "redis"`.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_lock_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

fn default_processed_ttl() -> u64 {
    DEFAULT_PROCESSED_TTL_SECS
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        IdempotencySettings {
            backend: GuardBackend::default(),
            lock_ttl_secs: default_lock_ttl(),
            processed_ttl_secs: default_processed_ttl(),
            redis_url: None,
        }
    }
}

impl IdempotencySettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn processed_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_ttl_secs)
    }
}

// =============================================================================
// Analytics Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSettings {
    #[serde(default)]
    pub cost_basis_policy: CostBasisPolicy,

    /// Average ticket above which a summary is flagged, in minor units.
    #[serde(default = "default_high_avg_transaction")]
    pub high_avg_transaction_threshold: Money,

    /// Recompute the day's summary after every reconciled event.
    #[serde(default = "default_true")]
    pub recompute_on_event: bool,
}

fn default_high_avg_transaction() -> Money {
    AnomalyThresholds::default().high_avg_transaction
}

fn default_true() -> bool {
    true
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        AnalyticsSettings {
            cost_basis_policy: CostBasisPolicy::default(),
            high_avg_transaction_threshold: default_high_avg_transaction(),
            recompute_on_event: true,
        }
    }
}

impl AnalyticsSettings {
    pub fn thresholds(&self) -> AnomalyThresholds {
        AnomalyThresholds {
            high_avg_transaction: self.high_avg_transaction_threshold,
            ..AnomalyThresholds::default()
        }
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_scheduler_interval")]
    pub interval_secs: u64,

    /// Business days recomputed per run, counting back from yesterday.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

fn default_scheduler_interval() -> u64 {
    3_600
}

fn default_lookback_days() -> u32 {
    2
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            enabled: true,
            interval_secs: default_scheduler_interval(),
            lookback_days: default_lookback_days(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Caller-side retry of infrastructure failures (the core never retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Give up after this long.
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_secs: u64,
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    10
}

fn default_max_elapsed() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_elapsed_secs: default_max_elapsed(),
        }
    }
}

impl RetrySettings {
    /// Exponential backoff built from these settings.
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_secs(self.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.max_elapsed_secs)),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete ledger service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub idempotency: IdempotencySettings,

    #[serde(default)]
    pub analytics: AnalyticsSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl LedgerConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (ledger.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ServiceResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading ledger config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load ledger config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> ServiceResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ServiceError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Ledger config saved");
        Ok(())
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ServiceError::InvalidConfig("database.path must not be empty".into()));
        }

        if self.database.max_connections == 0 {
            return Err(ServiceError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        // Real offsets range from UTC-12:00 to UTC+14:00
        if !(-12 * 60..=14 * 60).contains(&self.ledger.business_utc_offset_minutes) {
            return Err(ServiceError::InvalidConfig(format!(
                "ledger.business_utc_offset_minutes out of range: {}",
                self.ledger.business_utc_offset_minutes
            )));
        }

        if self.ledger.history_limit == 0 {
            return Err(ServiceError::InvalidConfig(
                "ledger.history_limit must be greater than 0".into(),
            ));
        }

        if self.idempotency.lock_ttl_secs == 0 {
            return Err(ServiceError::InvalidConfig(
                "idempotency.lock_ttl_secs must be greater than 0".into(),
            ));
        }

        if self.idempotency.processed_ttl_secs < self.idempotency.lock_ttl_secs {
            return Err(ServiceError::InvalidConfig(
                "idempotency.processed_ttl_secs must not be shorter than lock_ttl_secs".into(),
            ));
        }

        if self.idempotency.backend == GuardBackend::Redis {
            match self.idempotency.redis_url.as_deref() {
                Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {}
                Some(url) => {
                    return Err(ServiceError::InvalidConfig(format!(
                        "Redis URL must start with redis:// or rediss://, got: {}",
                        url
                    )))
                }
                None => {
                    return Err(ServiceError::InvalidConfig(
                        "idempotency.redis_url is required for the redis backend".into(),
                    ))
                }
            }
        }

        if !self.analytics.high_avg_transaction_threshold.is_positive() {
            return Err(ServiceError::InvalidConfig(
                "analytics.high_avg_transaction_threshold must be positive".into(),
            ));
        }

        if self.scheduler.enabled && self.scheduler.interval_secs == 0 {
            return Err(ServiceError::InvalidConfig(
                "scheduler.interval_secs must be greater than 0".into(),
            ));
        }

        if self.retry.initial_backoff_ms == 0 {
            return Err(ServiceError::InvalidConfig(
                "retry.initial_backoff_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TILL_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(max) = std::env::var("TILL_DATABASE_MAX_CONNECTIONS") {
            if let Ok(m) = max.parse::<u32>() {
                self.database.max_connections = m;
            }
        }

        if let Ok(offset) = std::env::var("TILL_BUSINESS_UTC_OFFSET_MINUTES") {
            match offset.parse::<i32>() {
                Ok(o) => self.ledger.business_utc_offset_minutes = o,
                Err(_) => warn!(offset = %offset, "Invalid business UTC offset in environment"),
            }
        }

        if let Ok(policy) = std::env::var("TILL_AUTO_OPEN_POLICY") {
            match policy.parse() {
                Ok(parsed) => {
                    debug!(policy = %policy, "Overriding auto-open policy from environment");
                    self.ledger.auto_open_policy = parsed;
                }
                Err(e) => warn!(%e, "Ignoring auto-open policy from environment"),
            }
        }

        if let Ok(backend) = std::env::var("TILL_IDEMPOTENCY_BACKEND") {
            match backend.parse() {
                Ok(parsed) => self.idempotency.backend = parsed,
                Err(e) => warn!(%e, "Ignoring idempotency backend from environment"),
            }
        }

        if let Ok(url) = std::env::var("TILL_REDIS_URL") {
            self.idempotency.redis_url = Some(url);
        }

        if let Ok(policy) = std::env::var("TILL_COST_BASIS_POLICY") {
            match policy.parse::<CostBasisPolicy>() {
                Ok(parsed) => self.analytics.cost_basis_policy = parsed,
                Err(e) => warn!(%e, "Ignoring cost basis policy from environment"),
            }
        }

        if let Ok(enabled) = std::env::var("TILL_SCHEDULER_ENABLED") {
            if let Ok(e) = enabled.parse::<bool>() {
                self.scheduler.enabled = e;
            }
        }

        if let Ok(interval) = std::env::var("TILL_SCHEDULER_INTERVAL_SECS") {
            if let Ok(i) = interval.parse::<u64>() {
                self.scheduler.interval_secs = i;
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "till", "ledger")
            .map(|dirs| dirs.config_dir().join("ledger.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("open".parse::<AutoOpenPolicy>().unwrap(), AutoOpenPolicy::Open);
        assert_eq!("REJECT".parse::<AutoOpenPolicy>().unwrap(), AutoOpenPolicy::Reject);
        assert!("sometimes".parse::<AutoOpenPolicy>().is_err());

        assert_eq!("redis".parse::<GuardBackend>().unwrap(), GuardBackend::Redis);
        assert_eq!("mem".parse::<GuardBackend>().unwrap(), GuardBackend::Memory);
        let err = "etcd".parse::<GuardBackend>().unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert_eq!(config.ledger.auto_open_policy, AutoOpenPolicy::Open);
        assert_eq!(config.ledger.history_limit, 50);
        assert_eq!(config.idempotency.lock_ttl(), Duration::from_secs(60));
        assert_eq!(config.idempotency.processed_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.analytics.cost_basis_policy, CostBasisPolicy::LatestBatch);
        assert_eq!(config.analytics.high_avg_transaction_threshold, Money::from_major(500_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LedgerConfig::default();
        config.ledger.business_utc_offset_minutes = 15 * 60;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.idempotency.backend = GuardBackend::Redis;
        assert!(config.validate().is_err());
        config.idempotency.redis_url = Some("http://cache:6379".into());
        assert!(config.validate().is_err());
        config.idempotency.redis_url = Some("redis://cache:6379".into());
        assert!(config.validate().is_ok());

        let mut config = LedgerConfig::default();
        config.idempotency.processed_ttl_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LedgerConfig = toml::from_str(
            r#"
            [ledger]
            business_utc_offset_minutes = 300
            auto_open_policy = "reject"

            [analytics]
            cost_basis_policy = "weighted_average"
            "#,
        )
        .unwrap();
        assert_eq!(config.ledger.business_utc_offset_minutes, 300);
        assert_eq!(config.ledger.auto_open_policy, AutoOpenPolicy::Reject);
        assert_eq!(config.ledger.history_limit, 50);
        assert_eq!(config.analytics.cost_basis_policy, CostBasisPolicy::WeightedAverage);
        assert!(config.analytics.recompute_on_event);
        assert_eq!(config.database.path, PathBuf::from("till.db"));
    }

    #[test]
    fn test_toml_serialization() {
        let config = LedgerConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[ledger]"));
        assert!(toml_str.contains("[idempotency]"));
        assert!(toml_str.contains("auto_open_policy = \"open\""));
    }

    #[test]
    fn test_retry_backoff() {
        let retry = RetrySettings::default();
        let backoff = retry.backoff();
        assert_eq!(backoff.initial_interval, Duration::from_millis(200));
        assert_eq!(backoff.max_elapsed_time, Some(Duration::from_secs(60)));
    }
}
