use crate::config::Settings;
use crate::router::create_router;
use crate::AppState;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use std::sync::Arc;
use tower::ServiceExt;

fn emit_request(ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/realtime/emit")
        .header("content-type", "application/json")
        .header("x-real-ip", ip)
        .body(Body::from(
            r#"{"room":"company:acme:main","event":"chat","payload":{"id":"m1","text":"hi"},"user":{"id":"u1","name":"A","role":"member"}}"#,
        ))
        .unwrap()
}

#[tokio::test]
async fn test_rate_limit() {
    let mut settings = Settings::default();
    settings.rate_limit.max_requests = 3;
    let state = Arc::new(AppState::new(settings));
    let app = create_router(state);

    for _ in 0..3 {
        let response = app.clone().oneshot(emit_request("127.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(emit_request("127.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // a different client still gets through
    let response = app.oneshot(emit_request("127.0.0.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_not_rate_limited() {
    let mut settings = Settings::default();
    settings.rate_limit.max_requests = 1;
    let app = create_router(Arc::new(AppState::new(settings)));

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-real-ip", "127.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
