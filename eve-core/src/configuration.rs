use anyhow::Context;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::time::Duration;

use crate::market_cache::{MarketCacheConfig, DEFAULT_GZIP_MAX_DECOMPRESSED, DEFAULT_L1_TTL_CAP_SECONDS};
use crate::reqwest_helpers::RateBudget;
use crate::route_calculator::RouteOptions;
use eve_store::PgConnectionString;

fn default_user_agent() -> String {
    "eve-route-optimizer (operator contact unset)".to_string()
}

fn default_rate_sustained() -> u32 {
    20
}

fn default_rate_burst() -> u32 {
    150
}

fn default_max_retries() -> u32 {
    4
}

fn default_bp_workers() -> usize {
    10
}

fn default_bp_page_timeout_s() -> u64 {
    15
}

fn default_rc_workers() -> usize {
    50
}

fn default_rc_total_deadline_s() -> u64 {
    30
}

fn default_rc_min_spread_pct() -> f64 {
    5.0
}

fn default_rc_max_routes() -> usize {
    50
}

fn default_mc_l1_ttl_cap_s() -> i64 {
    DEFAULT_L1_TTL_CAP_SECONDS
}

fn default_gzip_max() -> usize {
    DEFAULT_GZIP_MAX_DECOMPRESSED
}

/// Operator configuration, read from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    pub upstream_base_url: String,
    #[serde(default = "default_user_agent")]
    pub upstream_user_agent: String,
    #[serde(default = "default_rate_sustained")]
    pub upstream_rate_sustained: u32,
    #[serde(default = "default_rate_burst")]
    pub upstream_rate_burst: u32,
    /// Total attempt budget per request, first try included.
    #[serde(default = "default_max_retries")]
    pub upstream_max_retries: u32,

    #[serde(default = "default_bp_workers")]
    pub bp_workers: usize,
    #[serde(default = "default_bp_page_timeout_s")]
    pub bp_page_timeout_s: u64,

    #[serde(default = "default_rc_workers")]
    pub rc_workers: usize,
    #[serde(default = "default_rc_total_deadline_s")]
    pub rc_total_deadline_s: u64,
    #[serde(default = "default_rc_min_spread_pct")]
    pub rc_min_spread_pct: f64,
    #[serde(default = "default_rc_max_routes")]
    pub rc_max_routes: usize,

    #[serde(default = "default_mc_l1_ttl_cap_s")]
    pub mc_l1_ttl_cap_s: i64,
    #[serde(default)]
    pub mc_l2_url: Option<String>,
    #[serde(default = "default_gzip_max")]
    pub mc_l2_gzip_max_decompressed: usize,

    pub or_dsn: String,
    pub sus_path: String,
}

impl Configuration {
    pub fn from_env() -> anyhow::Result<Self> {
        envy::from_env::<Configuration>().context("reading configuration from environment")
    }

    pub fn pg_connection_string(&self) -> PgConnectionString {
        PgConnectionString(self.or_dsn.clone())
    }

    pub fn rate_budget(&self) -> RateBudget {
        RateBudget {
            sustained: self.upstream_rate_sustained,
            burst: self.upstream_rate_burst,
            max_attempts: self.upstream_max_retries,
        }
    }

    pub fn market_cache_config(&self) -> MarketCacheConfig {
        MarketCacheConfig {
            l1_ttl_cap: ChronoDuration::seconds(self.mc_l1_ttl_cap_s),
            populate_deadline: Duration::from_secs(self.bp_page_timeout_s),
            gzip_max_decompressed: self.mc_l2_gzip_max_decompressed,
        }
    }

    pub fn route_options(&self) -> RouteOptions {
        RouteOptions {
            min_spread_pct: self.rc_min_spread_pct,
            max_routes: self.rc_max_routes,
            total_deadline: Duration::from_secs(self.rc_total_deadline_s),
            workers: self.rc_workers,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_environment_fills_in_defaults() {
        let config: Configuration = envy::from_iter(vec![
            ("UPSTREAM_BASE_URL".to_string(), "https://esi.evetech.net/latest/".to_string()),
            ("OR_DSN".to_string(), "postgres://localhost/market".to_string()),
            ("SUS_PATH".to_string(), "/var/lib/universe.json".to_string()),
        ])
        .unwrap();

        assert_eq!(config.upstream_rate_sustained, 20);
        assert_eq!(config.upstream_rate_burst, 150);
        assert_eq!(config.bp_workers, 10);
        assert_eq!(config.rc_workers, 50);
        assert_eq!(config.rc_max_routes, 50);
        assert!(config.mc_l2_url.is_none());
        assert_eq!(config.mc_l1_ttl_cap_s, 300);
    }

    #[test]
    fn explicit_environment_overrides_win() {
        let config: Configuration = envy::from_iter(vec![
            ("UPSTREAM_BASE_URL".to_string(), "https://esi.evetech.net/latest/".to_string()),
            ("OR_DSN".to_string(), "postgres://localhost/market".to_string()),
            ("SUS_PATH".to_string(), "/var/lib/universe.json".to_string()),
            ("UPSTREAM_RATE_SUSTAINED".to_string(), "5".to_string()),
            ("RC_MIN_SPREAD_PCT".to_string(), "7.5".to_string()),
            ("MC_L2_URL".to_string(), "redis://cache:6379".to_string()),
        ])
        .unwrap();

        assert_eq!(config.upstream_rate_sustained, 5);
        assert!((config.rc_min_spread_pct - 7.5).abs() < 1e-9);
        assert_eq!(config.mc_l2_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn missing_required_keys_fail_loudly() {
        let result = envy::from_iter::<_, Configuration>(vec![("UPSTREAM_BASE_URL".to_string(), "https://example.test/".to_string())]);
        assert!(result.is_err());
    }
}
