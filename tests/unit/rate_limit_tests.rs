// ==============================
// tests/unit/rate_limit_tests.rs
// ==============================
//! This test suite validates the emit rate limiter's public surface.
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use backend_lib::config::RateLimitSettings;
use backend_lib::middleware::rate_limit::client_key;
use backend_lib::middleware::RateLimiter;

#[test]
fn test_budget_is_per_client() {
    let limiter = RateLimiter::new(Duration::from_secs(60), 3);
    for _ in 0..3 {
        assert!(limiter.check("10.0.0.1"));
    }
    assert!(!limiter.check("10.0.0.1"));
    assert!(limiter.check("10.0.0.2"));
    assert_eq!(limiter.tracked(), 2);
}

#[test]
fn test_cleanup_keeps_live_windows() {
    let limiter = RateLimiter::new(Duration::from_secs(60), 3);
    limiter.check("10.0.0.1");
    limiter.cleanup();
    assert_eq!(limiter.tracked(), 1);
}

#[test]
fn test_built_from_settings() {
    let settings = RateLimitSettings {
        max_requests: 1,
        window_secs: 60,
    };
    let limiter = RateLimiter::from(&settings);
    assert!(limiter.check("a"));
    assert!(!limiter.check("a"));
}

#[test]
fn test_client_key_prefers_real_ip() {
    let mut headers = HeaderMap::new();
    assert_eq!(client_key(&headers), "unknown");

    headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
    assert_eq!(client_key(&headers), "203.0.113.7");

    headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
    assert_eq!(client_key(&headers), "198.51.100.2");
}
