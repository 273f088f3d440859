//! Typed configuration options.
//!
//! Every knob has a serde default so partial configuration files work; the
//! short names used by the original deployment format are accepted as
//! aliases. All durations are milliseconds unless the field name says
//! otherwise.

use serde::{Deserialize, Serialize};

/// Cache entry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Data record time to live.
    #[serde(alias = "ttl")]
    pub ttl_ms: u64,

    /// Retention of the INFO metadata record, typically much longer than
    /// the data itself so refresh can resurrect expired entries.
    #[serde(alias = "info_ttl")]
    pub info_ttl_ms: u64,

    /// Remaining-TTL window inside which a slow entry is refreshed ahead
    /// of its expiry.
    #[serde(alias = "early_refresh", alias = "early_refresh_start", alias = "early_refresh_duration")]
    pub early_refresh_ms: u64,

    /// Fetch latency at which an entry counts as slow.
    #[serde(alias = "slow_duration")]
    pub slow_duration_ms: u64,

    /// Fetch latency at which an entry becomes eligible for proactive
    /// refresh (gets an EXP marker).
    #[serde(alias = "refresh_duration")]
    pub refresh_duration_ms: u64,

    /// Extra data TTL granted to slow entries so refresh can finish before
    /// the record disappears.
    #[serde(alias = "extra_ttl")]
    pub extra_ttl_ms: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl_ms: 900_001,
            info_ttl_ms: 24 * 3_600_000,
            early_refresh_ms: 70_000,
            slow_duration_ms: 500,
            refresh_duration_ms: 200,
            extra_ttl_ms: 60_000,
        }
    }
}

/// Local (per-instance) cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheOptions {
    /// Target capacity; writes are rejected once a sweep can no longer get
    /// occupancy below this.
    pub max_size: usize,

    /// Cap on how long a non-permanent entry stays resident locally, even
    /// when its shared TTL is longer.
    #[serde(alias = "default_ttl")]
    pub default_ttl_ms: u64,

    /// Maintenance sweep interval.
    #[serde(alias = "timer_interval")]
    pub timer_interval_ms: u64,
}

impl Default for LocalCacheOptions {
    fn default() -> Self {
        Self {
            max_size: 4096 * 16,
            default_ttl_ms: 300_000,
            timer_interval_ms: 30_000,
        }
    }
}

/// Refresh queue pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    /// Hard cap on candidates processed per tick.
    pub batch_size: usize,

    /// Tick interval.
    #[serde(alias = "refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Fraction of the queue refreshed per tick.
    pub size_ratio: f64,

    /// Fraction of the tick interval allowed as processing time budget.
    pub time_ratio: f64,

    /// Fraction of the queue dropped from the low-score end per tick.
    pub remove_ratio: f64,

    /// Queue length bound; lowest-scoring candidates are evicted beyond it.
    pub max_queue_size: usize,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            refresh_interval_ms: 300_000,
            size_ratio: 0.33,
            time_ratio: 0.33,
            remove_ratio: 0.33,
            max_queue_size: 8192 * 2,
        }
    }
}

/// Invalidation broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastOptions {
    pub channel_name: String,

    /// Whether a sender ignores its own messages.
    pub exclude_self: bool,

    /// Heartbeat / membership maintenance interval.
    #[serde(alias = "heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            channel_name: "strata::broadcast".to_string(),
            exclude_self: true,
            heartbeat_interval_ms: 100_000,
        }
    }
}

/// One sliding-window rate-limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub window_secs: u64,
    pub max_count: u64,
    /// Block duration once `max_count` is reached; defaults to ten windows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_secs: Option<u64>,
}

impl RateLimitRule {
    pub fn new(window_secs: u64, max_count: u64) -> Self {
        Self { window_secs, max_count, block_secs: None }
    }

    pub fn effective_block_secs(&self) -> u64 {
        self.block_secs.unwrap_or(self.window_secs * 10)
    }
}

/// Everything the engine needs, in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub cache: CacheOptions,
    pub local: LocalCacheOptions,
    pub refresh: RefreshOptions,
    pub broadcast: BroadcastOptions,
    pub rate_limits: Vec<RateLimitRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let opts = CacheOptions::default();
        assert_eq!(opts.ttl_ms, 900_001);
        assert_eq!(opts.info_ttl_ms, 86_400_000);
        assert_eq!(opts.slow_duration_ms, 500);

        let refresh = RefreshOptions::default();
        assert_eq!(refresh.batch_size, 64);
        assert_eq!(refresh.max_queue_size, 16_384);
    }

    #[test]
    fn short_option_names_are_accepted() {
        let opts: CacheOptions = serde_json::from_str(
            r#"{"ttl": 1000, "info_ttl": 2000, "early_refresh_start": 300, "slow_duration": 50}"#,
        )
        .unwrap();
        assert_eq!(opts.ttl_ms, 1000);
        assert_eq!(opts.info_ttl_ms, 2000);
        assert_eq!(opts.early_refresh_ms, 300);
        assert_eq!(opts.slow_duration_ms, 50);
        // unspecified fields keep their defaults
        assert_eq!(opts.extra_ttl_ms, 60_000);
    }

    #[test]
    fn rate_limit_block_defaults_to_ten_windows() {
        let rule = RateLimitRule::new(6, 100);
        assert_eq!(rule.effective_block_secs(), 60);
        let explicit = RateLimitRule { block_secs: Some(5), ..rule };
        assert_eq!(explicit.effective_block_secs(), 5);
    }

    #[test]
    fn engine_options_parse_from_partial_json() {
        let opts: EngineOptions = serde_json::from_str(
            r#"{
                "cache": {"ttl": 5000},
                "rate_limits": [{"window_secs": 1, "max_count": 3}]
            }"#,
        )
        .unwrap();
        assert_eq!(opts.cache.ttl_ms, 5000);
        assert_eq!(opts.local.max_size, 65_536);
        assert_eq!(opts.rate_limits.len(), 1);
    }
}
