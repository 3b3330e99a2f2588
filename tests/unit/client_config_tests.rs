// =================================
// tests/unit/client_config_tests.rs
// =================================
use std::time::Duration;

use client_lib::{ClientConfig, IdentityStore, SyncConfig};

#[test]
fn test_client_defaults() {
    let config = ClientConfig::new("http://relay.local:3000/");
    assert_eq!(config.base_url, "http://relay.local:3000");
    assert_eq!(config.backoff.max_retries, 10);
    // three missed heartbeats of the server default
    assert_eq!(config.stale_after, Some(Duration::from_secs(45)));
}

#[test]
fn test_sync_defaults() {
    let config = SyncConfig::new("company:acme:main");
    assert_eq!(config.idle_after, Duration::from_secs(300));
    assert_eq!(config.typing_expiry, Duration::from_secs(4));
}

#[test]
fn test_identity_is_stable_across_stores() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.json");
    let id = IdentityStore::new(&path).load_or_create().unwrap();
    assert_eq!(IdentityStore::new(&path).load_or_create().unwrap(), id);
}
