//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::Sku;
use messaging::{RelayConfig, RetryPolicy};
use order::ReconcileConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory stores when unset
/// - `ORDER_RESERVATION_TIMEOUT_MS`: how long `POST /orders` waits (default 5000)
/// - `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_BATCH_SIZE`: relay tuning (100, 100)
/// - `RETRY_MAX_ATTEMPTS`, `RETRY_INITIAL_BACKOFF_MS`: publish and handler retry (5, 50)
/// - `BUS_PARTITIONS`: partitions per topic (default 4)
/// - `DEAD_LETTER_CAPACITY`: dead letters kept per router (default 1024)
/// - `RECONCILE_INTERVAL_MS`, `RECONCILE_STALE_AFTER_MS`: reconciliation sweep (30000, 60000)
/// - `STATUS_CACHE_TTL_MS`: how long an unwatched order's last status stays cached (300000)
/// - `SEED_SKUS`: comma-separated SKUs seeded as available at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub reservation_timeout: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub bus_partitions: u32,
    pub dead_letter_capacity: usize,
    pub reconcile_interval: Duration,
    pub reconcile_stale_after: Duration,
    pub status_cache_ttl: Duration,
    pub seed_skus: Vec<Sku>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Unset or
    /// unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            parse_env::<u64>(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_env(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_env(&lookup, "LOG_FORMAT").unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            reservation_timeout: millis("ORDER_RESERVATION_TIMEOUT_MS", defaults.reservation_timeout),
            outbox_poll_interval: millis("OUTBOX_POLL_INTERVAL_MS", defaults.outbox_poll_interval),
            outbox_batch_size: parse_env(&lookup, "OUTBOX_BATCH_SIZE").unwrap_or(defaults.outbox_batch_size),
            retry_max_attempts: parse_env(&lookup, "RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry_max_attempts),
            retry_initial_backoff: millis("RETRY_INITIAL_BACKOFF_MS", defaults.retry_initial_backoff),
            bus_partitions: parse_env(&lookup, "BUS_PARTITIONS").unwrap_or(defaults.bus_partitions),
            dead_letter_capacity: parse_env(&lookup, "DEAD_LETTER_CAPACITY")
                .unwrap_or(defaults.dead_letter_capacity),
            reconcile_interval: millis("RECONCILE_INTERVAL_MS", defaults.reconcile_interval),
            reconcile_stale_after: millis("RECONCILE_STALE_AFTER_MS", defaults.reconcile_stale_after),
            status_cache_ttl: millis("STATUS_CACHE_TTL_MS", defaults.status_cache_ttl),
            seed_skus: lookup("SEED_SKUS")
                .map(|raw| parse_skus(&raw))
                .unwrap_or(defaults.seed_skus),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_initial_backoff)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: self.outbox_poll_interval,
            batch_size: self.outbox_batch_size,
            retry: self.retry_policy(),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: self.reconcile_interval,
            stale_after: self.reconcile_stale_after,
            // Live waiters never outlast the request timeout.
            correlation_ttl: self.reservation_timeout * 2,
            status_cache_ttl: self.status_cache_ttl,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            reservation_timeout: order::DEFAULT_RESERVATION_TIMEOUT,
            outbox_poll_interval: Duration::from_millis(100),
            outbox_batch_size: 100,
            retry_max_attempts: 5,
            retry_initial_backoff: Duration::from_millis(50),
            bus_partitions: 4,
            dead_letter_capacity: messaging::DEFAULT_DEAD_LETTER_CAPACITY,
            reconcile_interval: Duration::from_secs(30),
            reconcile_stale_after: Duration::from_secs(60),
            status_cache_ttl: Duration::from_secs(300),
            seed_skus: Vec::new(),
        }
    }
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

fn parse_skus(raw: &str) -> Vec<Sku> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Sku::new)
        .collect()
}
