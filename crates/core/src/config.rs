use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::snapshot::DataType;

const MIN_SNAPSHOT_TTL_MS: u64 = 1_000;
const MAX_SNAPSHOT_TTL_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub splitter: SplitterConfig,
    pub scheduler: SchedulerConfig,
    pub facade: FacadeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Use PostgreSQL for candles; otherwise an in-process store.
    pub enabled: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/market_data".to_string(),
            max_connections: 10,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub api_url: String,
    pub ws_url: String,
    pub max_candles_per_call: usize,
    pub poll_requests_per_second: u32,
    pub stream_requests_per_second: u32,
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.hyperliquid.xyz".to_string(),
            ws_url: "wss://api.hyperliquid.xyz/ws".to_string(),
            max_candles_per_call: 5000,
            poll_requests_per_second: 10,
            stream_requests_per_second: 2,
            request_timeout_ms: 10_000,
        }
    }
}

impl UpstreamConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ticker_ttl_ms: u64,
    pub order_book_ttl_ms: u64,
    pub trades_ttl_ms: u64,
    /// Maximum number of snapshot entries held in memory.
    pub memory_budget: usize,
    /// Trades kept per symbol on the cached tape.
    pub trade_tape_len: usize,
    pub stream_queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ticker_ttl_ms: 2_000,
            order_book_ttl_ms: 1_000,
            trades_ttl_ms: 5_000,
            memory_budget: 10_000,
            trade_tape_len: 500,
            stream_queue_capacity: 1024,
        }
    }
}

impl CacheConfig {
    /// TTL for a snapshot type, clamped to 1..=30 seconds.
    #[must_use]
    pub fn ttl_for(&self, data_type: DataType) -> Duration {
        let ms = match data_type {
            DataType::Ticker => self.ticker_ttl_ms,
            DataType::OrderBook => self.order_book_ttl_ms,
            DataType::Trades | DataType::Candles => self.trades_ttl_ms,
        };
        Duration::from_millis(ms.clamp(MIN_SNAPSHOT_TTL_MS, MAX_SNAPSHOT_TTL_MS))
    }

    #[must_use]
    pub fn with_memory_budget(mut self, entries: usize) -> Self {
        self.memory_budget = entries;
        self
    }

    #[must_use]
    pub fn with_ttl_ms(mut self, data_type: DataType, ttl_ms: u64) -> Self {
        match data_type {
            DataType::Ticker => self.ticker_ttl_ms = ttl_ms,
            DataType::OrderBook => self.order_book_ttl_ms = ttl_ms,
            DataType::Trades | DataType::Candles => self.trades_ttl_ms = ttl_ms,
        }
        self
    }

    #[must_use]
    pub fn with_trade_tape_len(mut self, len: usize) -> Self {
        self.trade_tape_len = len;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Requests per minute at which a key is promoted to streaming.
    pub stream_threshold_per_min: f64,
    /// Below this rate an active subscription becomes a reclaim candidate.
    pub reclaim_threshold_per_min: f64,
    pub idle_grace_ms: u64,
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub probe_interval_ms: u64,
    /// Consecutive failures per data type before routing is disabled.
    pub hard_failure_ceiling: u32,
    pub disabled_cooldown_ms: u64,
    pub maintenance_interval_ms: u64,
    pub min_window_ms: u64,
    pub max_window_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            stream_threshold_per_min: 6.0,
            reclaim_threshold_per_min: 1.0,
            idle_grace_ms: 120_000,
            max_reconnect_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            probe_interval_ms: 15_000,
            hard_failure_ceiling: 5,
            disabled_cooldown_ms: 300_000,
            maintenance_interval_ms: 1_000,
            min_window_ms: 30_000,
            max_window_ms: 600_000,
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub const fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    #[must_use]
    pub const fn disabled_cooldown(&self) -> Duration {
        Duration::from_millis(self.disabled_cooldown_ms)
    }

    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    #[must_use]
    pub const fn min_window(&self) -> Duration {
        Duration::from_millis(self.min_window_ms)
    }

    #[must_use]
    pub const fn max_window(&self) -> Duration {
        Duration::from_millis(self.max_window_ms)
    }

    #[must_use]
    pub fn with_thresholds(mut self, stream_per_min: f64, reclaim_per_min: f64) -> Self {
        self.stream_threshold_per_min = stream_per_min;
        self.reclaim_threshold_per_min = reclaim_per_min;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_hard_failure_ceiling(mut self, failures: u32) -> Self {
        self.hard_failure_ceiling = failures;
        self
    }

    #[must_use]
    pub fn with_idle_grace_ms(mut self, ms: u64) -> Self {
        self.idle_grace_ms = ms;
        self
    }

    #[must_use]
    pub fn with_probe_interval_ms(mut self, ms: u64) -> Self {
        self.probe_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn with_disabled_cooldown_ms(mut self, ms: u64) -> Self {
        self.disabled_cooldown_ms = ms;
        self
    }
}

/// How a fragmented overlap is turned into fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentPolicy {
    /// One fetch covering the whole requested range.
    #[default]
    FullRefetch,
    /// One fetch per missing span.
    StitchGaps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub fragment_policy: FragmentPolicy,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            fragment_policy: FragmentPolicy::FullRefetch,
        }
    }
}

impl SplitterConfig {
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    #[must_use]
    pub fn with_fragment_policy(mut self, policy: FragmentPolicy) -> Self {
        self.fragment_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Shared lanes for HIGH, NORMAL and LOW work.
    pub worker_count: usize,
    /// Dedicated lanes for CRITICAL work.
    pub critical_lanes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            critical_lanes: 2,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    #[must_use]
    pub fn with_critical_lanes(mut self, n: usize) -> Self {
        self.critical_lanes = n;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    pub default_timeout_ms: u64,
    pub critical_timeout_ms: u64,
    pub snapshot_retry_attempts: u32,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            critical_timeout_ms: 1_500,
            snapshot_retry_attempts: 2,
        }
    }
}

impl FacadeConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn critical_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_timeout_ms)
    }

    #[must_use]
    pub fn with_timeouts(mut self, default_ms: u64, critical_ms: u64) -> Self {
        self.default_timeout_ms = default_ms;
        self.critical_timeout_ms = critical_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_is_clamped() {
        let cache = CacheConfig::default()
            .with_ttl_ms(DataType::Ticker, 50)
            .with_ttl_ms(DataType::OrderBook, 120_000);
        assert_eq!(cache.ttl_for(DataType::Ticker), Duration::from_secs(1));
        assert_eq!(cache.ttl_for(DataType::OrderBook), Duration::from_secs(30));
        assert_eq!(cache.ttl_for(DataType::Trades), Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_prefer_full_refetch() {
        let config = AppConfig::default();
        assert_eq!(config.splitter.fragment_policy, FragmentPolicy::FullRefetch);
        assert_eq!(config.router.min_window(), Duration::from_secs(30));
        assert_eq!(config.router.max_window(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"splitter": {"fragment_policy": "stitch_gaps"}}"#).unwrap();
        assert_eq!(config.splitter.fragment_policy, FragmentPolicy::StitchGaps);
        assert_eq!(config.splitter.max_attempts, 3);
        assert_eq!(config.scheduler.worker_count, 4);
    }
}
