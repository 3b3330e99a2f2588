// ============================
// relay-backend-lib/src/lib.rs
// ============================
//! Core functionality of the realtime relay server.
//!
//! Clients open one long-lived SSE stream per room and submit events over a
//! plain POST. The broker fans each submission out to the other streams of
//! the room and keeps every stream informed about who else is present.

pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod router;

use std::sync::Arc;

use crate::broker::{Broker, BrokerOptions};
use crate::config::Settings;
use crate::middleware::RateLimiter;
use crate::registry::RoomRegistry;

/// Application state shared across all handlers
#[derive(Debug, Clone)]
pub struct AppState {
    /// Settings the server was started with
    pub settings: Arc<Settings>,
    /// Room membership
    pub registry: Arc<RoomRegistry>,
    /// Fan-out
    pub broker: Arc<Broker>,
    /// Emit rate limiter
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Create a new application state
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let broker = Arc::new(Broker::new(
            Arc::clone(&registry),
            BrokerOptions::from(&settings),
        ));
        let rate_limiter = Arc::new(RateLimiter::from(&settings.rate_limit));

        Self {
            settings: Arc::new(settings),
            registry,
            broker,
            rate_limiter,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
