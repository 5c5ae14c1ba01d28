use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for the subscription sync engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Subscription cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// How long a fetched record is served without touching the store (default: 60s)
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,
    /// Delay before the single automatic retry of a transient store error
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum number of per-user slots held at once
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Slots untouched for this long are dropped
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
}

/// Reconciliation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// Interval of the periodic safety-net poller
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Retries of a provider-unreachable failure in `reconcile_with_backoff`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Billing provider client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: default_staleness_window_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            max_entries: default_max_entries(),
            idle_eviction_secs: default_idle_eviction_secs(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_staleness_window_secs() -> u64 {
    60
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_idle_eviction_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Builder for SyncConfig with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.config.cache.staleness_window_secs = window.as_secs();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn with_reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.config.reconcile = reconcile;
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.config.provider = provider;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Load configuration from environment variables with SUBSYNC_ prefix
    pub fn from_env(mut self) -> Self {
        let cache = &mut self.config.cache;
        if let Some(secs) = parse_env_with_prefix("CACHE_STALENESS_SECS") {
            cache.staleness_window_secs = secs;
        }
        if let Some(ms) = parse_env_with_prefix("CACHE_RETRY_DELAY_MS") {
            cache.retry_delay_ms = ms;
        }
        if let Some(max) = parse_env_with_prefix("CACHE_MAX_ENTRIES") {
            cache.max_entries = max;
        }
        if let Some(secs) = parse_env_with_prefix("CACHE_IDLE_EVICTION_SECS") {
            cache.idle_eviction_secs = secs;
        }

        let reconcile = &mut self.config.reconcile;
        if let Some(secs) = parse_env_with_prefix("RECONCILE_INTERVAL_SECS") {
            reconcile.poll_interval_secs = secs;
        }
        if let Some(retries) = parse_env_with_prefix("RECONCILE_MAX_RETRIES") {
            reconcile.max_retries = retries;
        }
        if let Some(ms) = parse_env_with_prefix("RECONCILE_BASE_DELAY_MS") {
            reconcile.base_delay_ms = ms;
        }
        if let Some(ms) = parse_env_with_prefix("RECONCILE_MAX_DELAY_MS") {
            reconcile.max_delay_ms = ms;
        }

        if let Some(secs) = parse_env_with_prefix("PROVIDER_TIMEOUT_SECS") {
            self.config.provider.timeout_seconds = secs;
        }
        if let Some(retries) = parse_env_with_prefix("PROVIDER_MAX_RETRIES") {
            self.config.provider.max_retries = retries;
        }

        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] when:
    /// - the staleness window or poll interval is zero
    /// - the log level is not recognised
    /// - the backoff base delay exceeds the maximum delay
    /// - the provider timeout is zero
    pub fn build(self) -> Result<SyncConfig> {
        let config = self.config;

        if config.cache.staleness_window_secs == 0 {
            return Err(SyncError::configuration(
                "Cache staleness window must be greater than 0",
            ));
        }

        if config.cache.max_entries == 0 {
            return Err(SyncError::configuration(
                "Cache max_entries must be greater than 0",
            ));
        }

        if config.reconcile.poll_interval_secs == 0 {
            return Err(SyncError::configuration(
                "Reconcile poll interval must be greater than 0",
            ));
        }

        if config.reconcile.base_delay_ms > config.reconcile.max_delay_ms {
            return Err(SyncError::configuration(format!(
                "Reconcile base delay ({}ms) exceeds max delay ({}ms)",
                config.reconcile.base_delay_ms, config.reconcile.max_delay_ms
            )));
        }

        if config.provider.timeout_seconds == 0 {
            return Err(SyncError::configuration(
                "Provider timeout must be greater than 0",
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(SyncError::configuration(format!(
                "Invalid log level: {}. Must be one of: {}",
                config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        Ok(config)
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A live/test pair of provider price identifiers for one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PriceIds {
    #[serde(default)]
    pub live: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
}

impl PriceIds {
    pub fn new(live: Option<&str>, test: Option<&str>) -> Self {
        Self {
            live: live.map(str::to_string),
            test: test.map(str::to_string),
        }
    }

    /// True when neither identifier is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_none() && self.test.is_none()
    }

    fn from_env(plan_key: &str) -> Self {
        Self {
            live: get_env_with_prefix(&format!("PRICE_{plan_key}")),
            test: get_env_with_prefix(&format!("PRICE_{plan_key}_TEST")),
        }
    }
}

/// Price identifiers for every plan the product sells.
///
/// Read once at startup and handed to
/// [`PlanRegistry::from_catalog`](crate::billing::PlanRegistry::from_catalog).
/// Unset plans are logged when the registry is built, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlanCatalogConfig {
    #[serde(default)]
    pub starter_monthly: PriceIds,
    #[serde(default)]
    pub starter_yearly: PriceIds,
    #[serde(default)]
    pub pro_monthly: PriceIds,
    #[serde(default)]
    pub pro_yearly: PriceIds,
}

impl PlanCatalogConfig {
    /// Read `SUBSYNC_PRICE_<PLAN>` and `SUBSYNC_PRICE_<PLAN>_TEST` for each plan.
    pub fn from_env() -> Self {
        Self {
            starter_monthly: PriceIds::from_env("STARTER_MONTHLY"),
            starter_yearly: PriceIds::from_env("STARTER_YEARLY"),
            pro_monthly: PriceIds::from_env("PRO_MONTHLY"),
            pro_yearly: PriceIds::from_env("PRO_YEARLY"),
        }
    }
}
