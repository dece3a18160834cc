//! Identity extraction from the upstream proxy headers.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`
use vm_api::auth::{auth_middleware, AuthenticatedUser};

async fn whoami(axum::Extension(user): axum::Extension<AuthenticatedUser>) -> axum::Json<Value> {
    axum::Json(serde_json::json!({
        "username": user.username,
        "email": user.email,
    }))
}

fn create_test_app() -> Router {
    Router::new()
        .route("/whoami", get(whoami))
        .layer(middleware::from_fn(auth_middleware))
}

async fn call(headers: &[(&str, &str)]) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri("/whoami");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = create_test_app()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_each_identity_header_is_accepted() {
    for header in ["x-vm-user", "x-forwarded-user", "x-user"] {
        let (status, json) = call(&[(header, "alice")]).await;
        assert_eq!(status, StatusCode::OK, "{header}");
        assert_eq!(json["username"], "alice");
        assert!(json["email"].is_null());
    }
}

#[tokio::test]
async fn test_header_priority() {
    let (status, json) = call(&[
        ("x-user", "fallback"),
        ("x-forwarded-user", "forwarded"),
        ("x-vm-user", "proxy"),
    ])
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["username"], "proxy");
}

#[tokio::test]
async fn test_email_headers_are_extracted() {
    let (_, json) = call(&[("x-user", "alice"), ("x-vm-email", "alice@example.com")]).await;
    assert_eq!(json["email"], "alice@example.com");

    let (_, json) = call(&[
        ("x-user", "alice"),
        ("x-forwarded-email", "alice@corp.example"),
    ])
    .await;
    assert_eq!(json["email"], "alice@corp.example");
}

#[tokio::test]
async fn test_missing_identity_returns_401() {
    let (status, _) = call(&[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_blank_identity_returns_401() {
    let (status, _) = call(&[("x-user", "   ")]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_blank_header_falls_through_to_next() {
    let (status, json) = call(&[("x-vm-user", ""), ("x-user", "bob")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["username"], "bo");
}

#[tokio::test]
async fn test_invalid_utf8_header_returns_401() {
    let request = Request::builder()
        .uri("/whoami")
        .header("x-user", &b"\xFF\xFE"[..])
        .body(Body::empty())
        .unwrap();

    let response = create_test_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
