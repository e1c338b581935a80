//! Environment-driven runtime configuration.

use std::time::Duration;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Top-level runtime configuration.
///
/// Everything except the database URL has a workable default; the broker
/// is optional (polling-only deployments never touch it).
#[derive(Debug, Clone)]
pub struct MillraceConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// NATS server URL; `None` disables the broker entirely
    pub nats_url: Option<String>,

    /// JetStream stream name for outbox events
    pub event_stream_name: String,

    /// JetStream stream name for external message ingress
    pub message_stream_name: String,

    /// Snapshot every N versions; 0 disables snapshotting
    pub snapshot_interval: i64,

    /// Bound on concurrently outstanding event tasks per runner
    pub max_inflight: usize,

    /// Optional dispatch rate limit (events per second)
    pub max_events_per_second: Option<f64>,

    /// In-process state cache capacity
    pub state_cache_size: usize,

    /// Delay scheduler polling cadence
    pub delay_check_interval: Duration,
}

impl Default for MillraceConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            nats_url: None,
            event_stream_name: "millrace-events".to_string(),
            message_stream_name: "millrace-messages".to_string(),
            snapshot_interval: 0,
            max_inflight: 1,
            max_events_per_second: None,
            state_cache_size: 10_000,
            delay_check_interval: Duration::from_secs(1),
        }
    }
}

impl MillraceConfig {
    /// Load from the environment (reading a `.env` file when present).
    ///
    /// Recognized variables: `DATABASE_URL` (required), `NATS_URL`,
    /// `MILLRACE_EVENT_STREAM`, `MILLRACE_MESSAGE_STREAM`,
    /// `MILLRACE_SNAPSHOT_INTERVAL`, `MILLRACE_MAX_INFLIGHT`,
    /// `MILLRACE_MAX_EVENTS_PER_SECOND`, `MILLRACE_STATE_CACHE_SIZE`,
    /// `MILLRACE_DELAY_CHECK_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            nats_url: std::env::var("NATS_URL").ok(),
            ..Self::default()
        };

        if let Ok(value) = std::env::var("MILLRACE_EVENT_STREAM") {
            config.event_stream_name = value;
        }
        if let Ok(value) = std::env::var("MILLRACE_MESSAGE_STREAM") {
            config.message_stream_name = value;
        }
        config.snapshot_interval =
            parse_env("MILLRACE_SNAPSHOT_INTERVAL", config.snapshot_interval)?;
        config.max_inflight = parse_env("MILLRACE_MAX_INFLIGHT", config.max_inflight)?;
        config.state_cache_size =
            parse_env("MILLRACE_STATE_CACHE_SIZE", config.state_cache_size)?;
        if let Ok(value) = std::env::var("MILLRACE_MAX_EVENTS_PER_SECOND") {
            let rate: f64 = value.parse().map_err(|_| ConfigError::Invalid {
                name: "MILLRACE_MAX_EVENTS_PER_SECOND",
                value: value.clone(),
            })?;
            config.max_events_per_second = (rate > 0.0).then_some(rate);
        }
        if let Ok(value) = std::env::var("MILLRACE_DELAY_CHECK_MS") {
            let millis: u64 = value.parse().map_err(|_| ConfigError::Invalid {
                name: "MILLRACE_DELAY_CHECK_MS",
                value: value.clone(),
            })?;
            config.delay_check_interval = Duration::from_millis(millis);
        }
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MillraceConfig::default();
        assert_eq!(config.snapshot_interval, 0);
        assert_eq!(config.max_inflight, 1);
        assert!(config.nats_url.is_none());
        assert_eq!(config.delay_check_interval, Duration::from_secs(1));
    }
}
