// ==========================
// tests/unit/error_tests.rs
// ==========================
use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
use backend_lib::error::AppError;
use serde_json::Value;

async fn body_of(err: AppError) -> (StatusCode, Value) {
    let response = err.into_response();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_error_body_shape() {
    let (status, body) = body_of(AppError::InvalidInput("room is required".into())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VAL_001");
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn test_rate_limit_maps_to_429() {
    let (status, body) = body_of(AppError::RateLimitExceeded).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_001");
}

#[test]
fn test_internal_details_are_sanitized() {
    let err = AppError::from("lock poisoned at registry.rs:42");
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!err.sanitized_message().contains("registry.rs"));
}
