//! Exercises the REST surface (C8) end to end through the router, against
//! the in-memory store/bus and a fixed-table verifier, the same shape
//! `standalone_server.rs` uses for the webchat provider's router tests.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chat_bus::InMemoryBusClient;
use chat_core::AuthContext;
use chat_gateway::http;
use chat_gateway::state::AppState;
use chat_identity::{Config, CorsOrigins, RateLimitWindow, StaticVerifier};
use chat_store::{InMemoryStore, Store};
use serde_json::{Value, json};
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        store_dsn: "memory".into(),
        bus_dsn: "memory".into(),
        identity_verifier_secret: "unused-in-tests".into(),
        cors_origins: CorsOrigins::Any,
        rate_limit_max: 1_000,
        rate_limit_window_ms: 60_000,
        log_level: "info".into(),
        rate_limit_window: RateLimitWindow::Rolling24h,
        request_deadline_secs: 10,
    }
}

fn ctx(user_id: &str, tenant_id: &str) -> AuthContext {
    AuthContext {
        user_id: user_id.into(),
        tenant_id: Some(tenant_id.into()),
        tenant_role: Some("member".into()),
        platform_role: None,
        email: None,
        display_name: None,
    }
}

async fn test_app() -> Router {
    let store = Arc::new(InMemoryStore::new());
    store.seed_default_rules_if_empty().await.unwrap();
    let bus = Arc::new(InMemoryBusClient::new());
    let verifier = Arc::new(
        StaticVerifier::new()
            .with_token("alice-token", ctx("alice", "acme"))
            .with_token("bob-token", ctx("bob", "acme")),
    );
    let state = AppState::new(store, bus, verifier, test_config());
    http::router().with_state(state)
}

async fn call(app: &Router, method: &str, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.expect("router handles request");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_ok_without_auth() {
    let app = test_app().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["data"]["status"], "ok");
}

#[tokio::test]
async fn health_detailed_probes_store_and_bus() {
    let app = test_app().await;
    let request = Request::builder().uri("/health/detailed").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["data"]["store"], "ok");
    assert_eq!(json["data"]["bus"], "ok");
}

#[tokio::test]
async fn missing_bearer_token_is_rejected() {
    let app = test_app().await;
    let request = Request::builder().uri("/api/v1/conversations").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_and_list_direct_conversation() {
    let app = test_app().await;

    let (status, created) = call(
        &app,
        "POST",
        "/api/v1/conversations",
        "alice-token",
        json!({ "type": "DIRECT", "participantIds": ["bob"] }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["type"], "DIRECT");
    let conversation_id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, listed) = call(&app, "GET", "/api/v1/conversations", "alice-token", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    let conversations = listed["data"].as_array().unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["id"].as_str().unwrap(), conversation_id);

    let (status, bob_listed) = call(&app, "GET", "/api/v1/conversations", "bob-token", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bob_listed["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn announcement_conversations_are_rejected_from_this_endpoint() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/conversations",
        "alice-token",
        json!({ "type": "ANNOUNCEMENT", "participantIds": ["bob"] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn send_and_list_messages_in_a_conversation() {
    let app = test_app().await;
    let (_, created) = call(
        &app,
        "POST",
        "/api/v1/conversations",
        "alice-token",
        json!({ "type": "DIRECT", "participantIds": ["bob"] }),
    )
    .await;
    let cid = created["data"]["id"].as_str().unwrap().to_string();

    let (status, sent) = call(
        &app,
        "POST",
        &format!("/api/v1/conversations/{cid}/messages"),
        "alice-token",
        json!({ "content": "hello bob" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["data"]["content"], "hello bob");

    let (status, listed) = call(
        &app,
        "GET",
        &format!("/api/v1/conversations/{cid}/messages"),
        "bob-token",
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = listed["data"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "hello bob");
}

#[tokio::test]
async fn a_non_participant_cannot_read_the_conversation() {
    let store = Arc::new(InMemoryStore::new());
    store.seed_default_rules_if_empty().await.unwrap();
    let bus = Arc::new(InMemoryBusClient::new());
    let verifier = Arc::new(
        StaticVerifier::new()
            .with_token("alice-token", ctx("alice", "acme"))
            .with_token("bob-token", ctx("bob", "acme"))
            .with_token("carol-token", ctx("carol", "acme")),
    );
    let state = AppState::new(store, bus, verifier, test_config());
    let app = http::router().with_state(state);

    let (_, created) = call(
        &app,
        "POST",
        "/api/v1/conversations",
        "alice-token",
        json!({ "type": "DIRECT", "participantIds": ["bob"] }),
    )
    .await;
    let cid = created["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        "GET",
        &format!("/api/v1/conversations/{cid}"),
        "carol-token",
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn block_then_send_message_flow() {
    let app = test_app().await;

    let (status, blocked) = call(
        &app,
        "POST",
        "/api/v1/contacts/block",
        "alice-token",
        json!({ "userId": "bob" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(blocked["data"]["blockedUserId"], "bob");

    let (status, can) = call(&app, "GET", "/api/v1/contacts/can-message/bob", "alice-token", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(can["data"]["canMessage"], false);

    let (status, _) = call(&app, "DELETE", "/api/v1/contacts/block/bob", "alice-token", Value::Null).await;
    assert_eq!(status, StatusCode::OK);

    let (status, can_again) = call(&app, "GET", "/api/v1/contacts/can-message/bob", "alice-token", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(can_again["data"]["canMessage"], true);
}

#[tokio::test]
async fn contact_request_round_trip() {
    let app = test_app().await;

    let (status, created) = call(
        &app,
        "POST",
        "/api/v1/contacts/requests",
        "alice-token",
        json!({ "toUserId": "bob", "message": "let's connect" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let request_id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, sent) = call(&app, "GET", "/api/v1/contacts/requests/sent", "alice-token", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["data"].as_array().unwrap().len(), 1);

    let (status, received) = call(&app, "GET", "/api/v1/contacts/requests", "bob-token", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(received["data"].as_array().unwrap().len(), 1);

    let (status, responded) = call(
        &app,
        "POST",
        &format!("/api/v1/contacts/requests/{request_id}/respond"),
        "bob-token",
        json!({ "action": "accept" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(responded["data"]["status"], "ACCEPTED");
}

#[tokio::test]
async fn contact_request_message_over_limit_is_rejected() {
    let app = test_app().await;
    let too_long = "x".repeat(501);
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/contacts/requests",
        "alice-token",
        json!({ "toUserId": "bob", "message": too_long }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}
