//! Client configuration.
use std::time::Duration;

/// Reconnect schedule of the streaming connections
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound of any single delay
    pub max: Duration,
    /// Growth factor between consecutive retries
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 10,
        }
    }
}

/// Connection settings of a `Multiplexer`
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the relay, e.g. `http://127.0.0.1:3000`
    pub base_url: String,
    pub backoff: BackoffConfig,
    /// Timeout of emit requests; streams have none
    pub request_timeout: Duration,
    /// Reconnect when a stream stays silent this long (server pings every 15 s)
    pub stale_after: Option<Duration>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            backoff: BackoffConfig::default(),
            request_timeout: Duration::from_secs(10),
            stale_after: Some(Duration::from_secs(45)),
        }
    }
}
