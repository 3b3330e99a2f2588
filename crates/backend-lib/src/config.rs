// ============================
// relay-backend-lib/src/config.rs
// ============================
//! Configuration management.
//!
//! Settings are layered with `figment`: built-in defaults, then a TOML
//! file, then `RELAY_`-prefixed environment variables. Nested keys use a
//! double underscore, e.g. `RELAY_STREAM__HEARTBEAT_SECS=5`.
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: LogFormat,
    /// Streaming endpoint settings
    pub stream: StreamSettings,
    /// Fan-out policy
    pub broker: BrokerSettings,
    /// Emit endpoint rate limiting
    pub rate_limit: RateLimitSettings,
    /// Cross-origin policy
    pub cors: CorsSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Idle interval after which a `ping` frame is written
    pub heartbeat_secs: u64,
    /// Frames queued per connection before new ones are dropped
    pub buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Deliver published events back to connections of the publishing user
    pub echo_to_sender: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Emits allowed per client per window
    pub max_requests: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub allow_any_origin: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            stream: StreamSettings::default(),
            broker: BrokerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            cors: CorsSettings::default(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            buffer: 64,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window_secs: 60,
        }
    }
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allow_any_origin: true,
        }
    }
}

impl StreamSettings {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Settings {
    /// Load from `relay.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from the given TOML file (if present) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings: Settings = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RELAY_").split("__"))
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            bail!("invalid log level: {}", self.log_level);
        }
        if self.stream.heartbeat_secs == 0 {
            bail!("stream.heartbeat_secs must be greater than zero");
        }
        if self.stream.buffer == 0 {
            bail!("stream.buffer must be greater than zero");
        }
        if self.rate_limit.max_requests == 0 {
            bail!("rate_limit.max_requests must be greater than zero");
        }
        if self.rate_limit.window_secs == 0 {
            bail!("rate_limit.window_secs must be greater than zero");
        }
        Ok(())
    }
}
