//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! unparseable. The database URL is wrapped in `secrecy::SecretString` to
//! keep credentials out of logs.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Postgres pool size.
    pub max_connections: u32,
    pub protocol: ProtocolConfig,
}

/// Queue names and consumer tuning shared by coordinator, worker and completer.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub request_queue: String,
    pub reply_queue: String,
    /// Maximum deliveries a consumer processes concurrently.
    pub prefetch: usize,
    /// How long a received message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Poll fallback when no commit notification arrives.
    pub poll_interval: Duration,
    /// Delay before a rolled-back delivery becomes visible again.
    pub retry_delay: Duration,
    /// Deliveries read more often than this are dead-lettered. `None` retries forever.
    pub max_deliveries: Option<i32>,
    /// Simulated latency of the default worker task.
    pub task_latency: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_queue: "work-requests".to_string(),
            reply_queue: "work-replies".to_string(),
            prefetch: 4,
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            max_deliveries: Some(5),
            task_latency: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ProtocolConfig::default();

        let max_deliveries: i32 = parsed(&lookup, "TXFLOW_MAX_DELIVERIES", 5)?;

        Ok(Self {
            database_url: SecretString::from(required(&lookup, "DATABASE_URL")?),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            max_connections: parsed(&lookup, "TXFLOW_MAX_CONNECTIONS", 10)?,
            protocol: ProtocolConfig {
                request_queue: lookup("TXFLOW_REQUEST_QUEUE").unwrap_or(defaults.request_queue),
                reply_queue: lookup("TXFLOW_REPLY_QUEUE").unwrap_or(defaults.reply_queue),
                prefetch: parsed(&lookup, "TXFLOW_PREFETCH", defaults.prefetch)?.max(1),
                visibility_timeout: Duration::from_secs(parsed(
                    &lookup,
                    "TXFLOW_VISIBILITY_TIMEOUT_SECS",
                    defaults.visibility_timeout.as_secs(),
                )?),
                poll_interval: Duration::from_millis(parsed(
                    &lookup,
                    "TXFLOW_POLL_INTERVAL_MS",
                    5000,
                )?),
                retry_delay: Duration::from_secs(parsed(
                    &lookup,
                    "TXFLOW_RETRY_DELAY_SECS",
                    defaults.retry_delay.as_secs(),
                )?),
                max_deliveries: (max_deliveries > 0).then_some(max_deliveries),
                task_latency: Duration::from_millis(parsed(
                    &lookup,
                    "TXFLOW_TASK_LATENCY_MS",
                    10_000,
                )?),
            },
        })
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    lookup(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}
