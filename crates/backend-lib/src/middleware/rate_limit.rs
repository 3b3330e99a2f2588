//! Fixed-window rate limiting of event submissions per client address.
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use metrics::counter;

use crate::config::RateLimitSettings;
use crate::error::AppError;
use crate::metrics::EMIT_REJECTED;
use crate::AppState;

/// Rate limit entry for a client
#[derive(Debug)]
struct RateLimitEntry {
    requests: u32,
    window_start: Instant,
}

/// Per-client request budget
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    entries: DashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            entries: DashMap::new(),
        }
    }

    /// Count one request for `client`; false once the budget is spent
    pub fn check(&self, client: &str) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> bool {
        let mut entry = self
            .entries
            .entry(client.to_string())
            .or_insert_with(|| RateLimitEntry {
                requests: 0,
                window_start: now,
            });

        // Check if window has expired
        if now.duration_since(entry.window_start) >= self.window {
            entry.requests = 0;
            entry.window_start = now;
        }

        if entry.requests >= self.max_requests {
            return false;
        }
        entry.requests += 1;
        true
    }

    /// Drop entries whose window has passed
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < self.window);
    }

    /// Clients currently tracked
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

impl From<&RateLimitSettings> for RateLimiter {
    fn from(settings: &RateLimitSettings) -> Self {
        Self::new(settings.window(), settings.max_requests)
    }
}

/// Client key: `x-real-ip`, else the first `x-forwarded-for` hop, else `unknown`
pub fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|v| v.split(',').next())
        })
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Rate limiter middleware
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = client_key(request.headers());
    if !state.rate_limiter.check(&client) {
        counter!(EMIT_REJECTED).increment(1);
        tracing::warn!(client = %client, "emit rate limit exceeded");
        return Err(AppError::RateLimitExceeded);
    }

    Ok(next.run(request).await)
}
