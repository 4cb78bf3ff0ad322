//! Configuration loading and validation for the gateway process.
//!
//! All values are read from environment variables at startup. The process
//! exits with a clear error message if any required variable is missing or
//! invalid. Pool sizing and the unlock rate limit remain hot-tunable at
//! runtime through `Pool::update_config` and `Dispatcher::update_rate_limit`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::pool::{PoolConfig, Target};
use crate::unlock::UnlockConfig;
use crate::util::backoff::BackoffConfig;

/// Validated gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP front-end listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enclave targets, comma-separated `id=endpoint` pairs. **Required.**
    pub targets: String,

    // --- connection pool ---
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_keepalive_time_secs")]
    pub keepalive_time_secs: u64,
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    // --- unlock dispatcher ---
    #[serde(default = "default_unlock_max_queue")]
    pub unlock_max_queue: usize,
    #[serde(default = "default_unlock_workers")]
    pub unlock_workers: usize,
    /// Unlock notifications per second; `0` disables rate limiting.
    #[serde(default)]
    pub unlock_rate_limit: f64,
    #[serde(default = "default_unlock_rate_burst")]
    pub unlock_rate_burst: u32,
    #[serde(default = "default_unlock_backoff_base_ms")]
    pub unlock_backoff_base_ms: u64,
    #[serde(default = "default_unlock_backoff_max_ms")]
    pub unlock_backoff_max_ms: u64,
    #[serde(default = "default_unlock_keyspace")]
    pub unlock_keyspace: String,
    #[serde(default = "default_unlock_retry_min_ms")]
    pub unlock_retry_min_ms: u64,
    #[serde(default = "default_unlock_retry_max_ms")]
    pub unlock_retry_max_ms: u64,
    /// Static key material for the mock KMS provider; when unset the unlock
    /// executor degrades to a no-op.
    #[serde(default)]
    pub unlock_kms_mock_key: Option<String>,

    // --- key cache (plaintext TTLs and budgets) ---
    #[serde(default = "default_cache_soft_ttl_secs")]
    pub cache_soft_ttl_secs: u64,
    #[serde(default = "default_cache_hard_ttl_secs")]
    pub cache_hard_ttl_secs: u64,
    #[serde(default = "default_cache_dek_valid_secs")]
    pub cache_dek_valid_secs: u64,
    #[serde(default = "default_cache_max_uses")]
    pub cache_max_uses: u32,
    #[serde(default = "default_cache_low_water")]
    pub cache_low_water: u32,
    #[serde(default = "default_cache_refresh_budget_ms")]
    pub cache_refresh_budget_ms: u64,

    // --- prefetcher ---
    #[serde(default = "default_prefetch_window_secs")]
    pub prefetch_window_secs: u64,
    /// Scan interval; `0` means half the refresh window.
    #[serde(default)]
    pub prefetch_interval_secs: u64,
    #[serde(default = "default_prefetch_jitter")]
    pub prefetch_jitter: f64,
    #[serde(default = "default_prefetch_max_in_flight")]
    pub prefetch_max_in_flight: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_pool_min() -> usize {
    16
}
fn default_pool_max() -> usize {
    32
}
fn default_acquire_timeout_ms() -> u64 {
    250
}
fn default_dial_timeout_ms() -> u64 {
    500
}
fn default_call_timeout_ms() -> u64 {
    2_000
}
fn default_keepalive_time_secs() -> u64 {
    30
}
fn default_keepalive_timeout_secs() -> u64 {
    10
}
fn default_health_interval_secs() -> u64 {
    5
}
fn default_service_name() -> String {
    crate::rpc::SERVICE_NAME.into()
}
fn default_backoff_initial_ms() -> u64 {
    25
}
fn default_backoff_max_ms() -> u64 {
    200
}
fn default_backoff_jitter() -> f64 {
    0.2
}
fn default_unlock_max_queue() -> usize {
    2048
}
fn default_unlock_workers() -> usize {
    16
}
fn default_unlock_rate_burst() -> u32 {
    1
}
fn default_unlock_backoff_base_ms() -> u64 {
    50
}
fn default_unlock_backoff_max_ms() -> u64 {
    1_000
}
fn default_unlock_keyspace() -> String {
    "default".into()
}
fn default_unlock_retry_min_ms() -> u64 {
    50
}
fn default_unlock_retry_max_ms() -> u64 {
    200
}
fn default_cache_soft_ttl_secs() -> u64 {
    15 * 60
}
fn default_cache_hard_ttl_secs() -> u64 {
    16 * 60
}
fn default_cache_dek_valid_secs() -> u64 {
    60 * 60
}
fn default_cache_max_uses() -> u32 {
    1_000_000
}
fn default_cache_low_water() -> u32 {
    50_000
}
fn default_cache_refresh_budget_ms() -> u64 {
    3
}
fn default_prefetch_window_secs() -> u64 {
    2 * 60
}
fn default_prefetch_jitter() -> f64 {
    0.1
}
fn default_prefetch_max_in_flight() -> usize {
    32
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first
    /// failure.
    pub fn validate(&self) -> Result<()> {
        if self.targets.trim().is_empty() {
            anyhow::bail!("TARGETS is required (format id=endpoint,id2=endpoint2)");
        }
        self.parse_targets()?;
        if self.pool_min == 0 || self.pool_max == 0 {
            anyhow::bail!("POOL_MIN and POOL_MAX must be > 0");
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            anyhow::bail!("BACKOFF_JITTER must be in [0, 1)");
        }
        if self.cache_hard_ttl_secs < self.cache_soft_ttl_secs {
            anyhow::bail!("CACHE_HARD_TTL_SECS must be >= CACHE_SOFT_TTL_SECS");
        }
        if self.cache_dek_valid_secs < self.cache_hard_ttl_secs {
            anyhow::bail!("CACHE_DEK_VALID_SECS must be >= CACHE_HARD_TTL_SECS");
        }
        if self.unlock_retry_max_ms < self.unlock_retry_min_ms {
            anyhow::bail!("UNLOCK_RETRY_MAX_MS must be >= UNLOCK_RETRY_MIN_MS");
        }
        Ok(())
    }

    /// Parse the `id=endpoint` target list.
    pub fn parse_targets(&self) -> Result<Vec<Target>> {
        let mut targets = Vec::new();
        for part in self.targets.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (id, endpoint) = part
                .split_once('=')
                .with_context(|| format!("invalid enclave entry: {part}"))?;
            let (id, endpoint) = (id.trim(), endpoint.trim());
            if id.is_empty() || endpoint.is_empty() {
                anyhow::bail!("invalid enclave entry: {part}");
            }
            targets.push(Target {
                id: id.to_owned(),
                endpoint: endpoint.to_owned(),
                metadata: Default::default(),
            });
        }
        if targets.is_empty() {
            anyhow::bail!("no enclave targets provided");
        }
        Ok(targets)
    }

    /// Pool configuration snapshot.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_conns: self.pool_min,
            max_conns: self.pool_max,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            keepalive_time: Duration::from_secs(self.keepalive_time_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
            health_check_interval: Duration::from_secs(self.health_interval_secs),
            service_name: self.service_name.clone(),
            backoff: BackoffConfig {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                jitter: self.backoff_jitter,
            },
        }
    }

    /// Unlock dispatcher configuration.
    pub fn unlock_config(&self) -> UnlockConfig {
        UnlockConfig {
            max_queue: self.unlock_max_queue,
            workers: self.unlock_workers,
            rate_limit: self.unlock_rate_limit,
            rate_burst: self.unlock_rate_burst,
            backoff_base: Duration::from_millis(self.unlock_backoff_base_ms),
            backoff_max: Duration::from_millis(self.unlock_backoff_max_ms),
        }
    }

    /// Key cache TTLs and budgets, applied to every entry at construction.
    pub fn cache_defaults(&self) -> CacheDefaults {
        CacheDefaults {
            soft_ttl: Duration::from_secs(self.cache_soft_ttl_secs),
            hard_ttl: Duration::from_secs(self.cache_hard_ttl_secs),
            dek_valid_for: Duration::from_secs(self.cache_dek_valid_secs),
            max_uses: self.cache_max_uses,
            low_water: self.cache_low_water,
            refresh_budget: Duration::from_millis(self.cache_refresh_budget_ms),
        }
    }

    /// Prefetcher scan parameters.
    pub fn prefetch_defaults(&self) -> PrefetchDefaults {
        PrefetchDefaults {
            refresh_window: Duration::from_secs(self.prefetch_window_secs),
            interval: Duration::from_secs(self.prefetch_interval_secs),
            jitter_percent: self.prefetch_jitter,
            max_in_flight: self.prefetch_max_in_flight,
        }
    }
}

/// Per-entry cache parameters derived from process configuration.
#[derive(Debug, Clone, Copy)]
pub struct CacheDefaults {
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub dek_valid_for: Duration,
    pub max_uses: u32,
    pub low_water: u32,
    pub refresh_budget: Duration,
}

/// Prefetcher parameters derived from process configuration.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchDefaults {
    pub refresh_window: Duration,
    pub interval: Duration,
    pub jitter_percent: f64,
    pub max_in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            targets: "enc-a=10.0.0.1:9090,enc-b=vsock://16:5005".into(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            keepalive_time_secs: default_keepalive_time_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
            service_name: default_service_name(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            unlock_max_queue: default_unlock_max_queue(),
            unlock_workers: default_unlock_workers(),
            unlock_rate_limit: 0.0,
            unlock_rate_burst: default_unlock_rate_burst(),
            unlock_backoff_base_ms: default_unlock_backoff_base_ms(),
            unlock_backoff_max_ms: default_unlock_backoff_max_ms(),
            unlock_keyspace: default_unlock_keyspace(),
            unlock_retry_min_ms: default_unlock_retry_min_ms(),
            unlock_retry_max_ms: default_unlock_retry_max_ms(),
            unlock_kms_mock_key: None,
            cache_soft_ttl_secs: default_cache_soft_ttl_secs(),
            cache_hard_ttl_secs: default_cache_hard_ttl_secs(),
            cache_dek_valid_secs: default_cache_dek_valid_secs(),
            cache_max_uses: default_cache_max_uses(),
            cache_low_water: default_cache_low_water(),
            cache_refresh_budget_ms: default_cache_refresh_budget_ms(),
            prefetch_window_secs: default_prefetch_window_secs(),
            prefetch_interval_secs: 0,
            prefetch_jitter: default_prefetch_jitter(),
            prefetch_max_in_flight: default_prefetch_max_in_flight(),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        assert_eq!(default_pool_min(), 16);
        assert_eq!(default_pool_max(), 32);
        assert_eq!(default_acquire_timeout_ms(), 250);
        assert_eq!(default_dial_timeout_ms(), 500);
        assert_eq!(default_health_interval_secs(), 5);
        assert_eq!(default_service_name(), "signer.v1.SignerService");
        assert_eq!(default_unlock_max_queue(), 2048);
        assert_eq!(default_unlock_workers(), 16);
        assert_eq!(default_cache_soft_ttl_secs(), 900);
        assert_eq!(default_cache_hard_ttl_secs(), 960);
        assert_eq!(default_cache_dek_valid_secs(), 3600);
        assert_eq!(default_cache_max_uses(), 1_000_000);
        assert_eq!(default_cache_low_water(), 50_000);
        assert_eq!(default_cache_refresh_budget_ms(), 3);
        assert_eq!(default_prefetch_window_secs(), 120);
        assert_eq!(default_prefetch_max_in_flight(), 32);
    }

    #[test]
    fn parses_target_list() {
        let cfg = base_config();
        let targets = cfg.parse_targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "enc-a");
        assert_eq!(targets[0].endpoint, "10.0.0.1:9090");
        assert_eq!(targets[1].id, "enc-b");
        assert_eq!(targets[1].endpoint, "vsock://16:5005");
    }

    #[test]
    fn rejects_malformed_targets() {
        let mut cfg = base_config();
        cfg.targets = "enc-a".into();
        assert!(cfg.validate().is_err());
        cfg.targets = "=endpoint".into();
        assert!(cfg.validate().is_err());
        cfg.targets = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_ttls() {
        let mut cfg = base_config();
        cfg.cache_hard_ttl_secs = cfg.cache_soft_ttl_secs - 1;
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.cache_dek_valid_secs = cfg.cache_hard_ttl_secs - 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_pool_sizes() {
        let mut cfg = base_config();
        cfg.pool_min = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pool_config_carries_knobs() {
        let cfg = base_config();
        let pool = cfg.pool_config();
        assert_eq!(pool.min_conns, 16);
        assert_eq!(pool.max_conns, 32);
        assert_eq!(pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(pool.backoff.initial, Duration::from_millis(25));
        assert_eq!(pool.backoff.max, Duration::from_millis(200));
    }

    #[test]
    fn cache_defaults_keep_ttl_ordering() {
        let d = base_config().cache_defaults();
        assert!(d.dek_valid_for >= d.hard_ttl);
        assert!(d.hard_ttl >= d.soft_ttl);
        assert_eq!(d.refresh_budget, Duration::from_millis(3));
    }
}
