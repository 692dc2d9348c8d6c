//! End-to-end exercise of the device command loop: register, queue from the
//! UI surface, poll with a signed request, drain.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use lodestone::auth::assertion::AssertionVerifier;
use lodestone::auth::hawk;
use lodestone::auth::session::{mint_token, JwtState};
use lodestone::commands::CommandRouter;
use lodestone::config::Config;
use lodestone::db::DBLayer;
use lodestone::push::PushClient;
use lodestone::registry::ConnectionRegistry;
use lodestone::ws::handler::AppState;

const HOST: &str = "localhost:8080";

struct Fixture {
    _dir: tempfile::TempDir,
    app: Router,
    registry: ConnectionRegistry,
    config: Arc<Config>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(Config {
        auth_disabled: true,
        ..Config::default()
    });
    let db = Arc::new(DBLayer::new(dir.path().to_str().expect("utf8 path")).expect("open db"));
    let registry = ConnectionRegistry::new();
    let push = PushClient::new().expect("push client");
    let verifier = Arc::new(AssertionVerifier::from_config(&config));
    let commands = Arc::new(CommandRouter::new(
        db.clone(),
        registry.clone(),
        push,
        config.clone(),
    ));
    let state = AppState {
        db,
        registry: registry.clone(),
        commands,
        verifier,
        config: config.clone(),
    };
    let jwt = JwtState {
        secret: config.jwt_secret.clone(),
    };
    Fixture {
        _dir: dir,
        app: lodestone::app(state, jwt),
        registry,
        config,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
    let resp = app.clone().oneshot(req).await.expect("infallible");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body");
    (status, body.to_vec(), headers)
}

/// Register a device and return (device_id, secret, user token).
async fn register_device(fx: &Fixture, device_id: &str) -> (String, String, String) {
    let body = json!({
        "deviceid": device_id,
        "pushurl": "http://127.0.0.1:1/push",
        "assert": "",
        "accepts": ["lock", "ring", "erase", "track"],
        "has_passcode": true,
    });
    let req = Request::builder()
        .method("POST")
        .uri("/register")
        .header(header::HOST, HOST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let (status, body, _) = send(&fx.app, req).await;
    assert_eq!(status, StatusCode::OK);

    let reply: Value = serde_json::from_slice(&body).expect("json reply");
    let secret = reply["secret"].as_str().expect("secret").to_string();
    let clientid = reply["clientid"].as_str().expect("clientid").to_string();
    assert_eq!(reply["deviceid"].as_str(), Some(device_id));
    assert!(!secret.is_empty());

    let token = mint_token(&fx.config.jwt_secret, &clientid, 600).expect("token");
    (device_id.to_string(), secret, token)
}

fn signed_poll(device_id: &str, secret: &str, body: &str) -> Request<Body> {
    let path = format!("/cmd/{device_id}");
    let ctx = hawk::RequestContext::from_host_header("POST", &path, HOST);
    let auth = hawk::response_header(
        device_id,
        &ctx,
        "application/json",
        body.as_bytes(),
        "",
        secret,
    )
    .expect("sign request");

    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::HOST, HOST)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, auth)
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn queue_request(device_id: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/queue/{device_id}"))
        .header(header::HOST, HOST)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn queue_then_poll_delivers_exactly_once() {
    let fx = fixture();
    let (device_id, secret, token) = register_device(&fx, "itest-dev-1").await;

    // No live session and an unreachable push endpoint: the enqueue call
    // reports the push failure, but the command is durably stored.
    let (status, _, _) = send(
        &fx.app,
        queue_request(&device_id, &token, json!({"l": {"c": "99999"}})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // The device's next signed poll retrieves the (clamped) command...
    let (status, body, headers) = send(&fx.app, signed_poll(&device_id, &secret, "{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"{"l":{"c":"9999"}}"#);

    // ...and the response is signed so the device can verify the server.
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .expect("response auth header");
    let parsed = hawk::parse_header(auth).expect("parse response header");
    let ctx = hawk::RequestContext::from_host_header("POST", "/cmd/itest-dev-1", HOST);
    assert!(hawk::verify(&ctx, "application/json", &body, &parsed, &secret).expect("verify"));

    // The slot is empty afterwards.
    let (status, body, _) = send(&fx.app, signed_poll(&device_id, &secret, "{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"{}");
}

#[tokio::test]
async fn unacceptable_command_reports_422_without_storing() {
    let fx = fixture();
    let (device_id, secret, token) = register_device(&fx, "itest-dev-2").await;

    // 'm' was not in the registered accepts set.
    let (status, body, _) = send(
        &fx.app,
        queue_request(&device_id, &token, json!({"m": {"m": "hello"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["error"].as_i64(), Some(422));
    assert_eq!(reply["cmd"].as_str(), Some("m"));

    // Nothing was queued.
    let (status, body, _) = send(&fx.app, signed_poll(&device_id, &secret, "{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"{}");
}

#[tokio::test]
async fn live_session_wake_skips_push() {
    let fx = fixture();
    let (device_id, _secret, token) = register_device(&fx, "itest-dev-3").await;

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    fx.registry.add(&device_id, tx);

    let (status, _, _) = send(
        &fx.app,
        queue_request(&device_id, &token, json!({"r": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(matches!(
        rx.try_recv(),
        Ok(lodestone::registry::SessionControl::Wake)
    ));
}

#[tokio::test]
async fn tampered_signature_is_unauthorized() {
    let fx = fixture();
    let (device_id, secret, _token) = register_device(&fx, "itest-dev-4").await;

    let req = signed_poll(&device_id, &secret, "{}");
    let (parts, body) = req.into_parts();
    let mut parts = parts;
    let auth = parts.headers[header::AUTHORIZATION]
        .to_str()
        .unwrap()
        .to_string();
    // Corrupt the MAC field.
    let tampered = auth.replace("mac=\"", "mac=\"AAAA");
    parts.headers.insert(
        header::AUTHORIZATION,
        tampered.parse().expect("header value"),
    );
    let req = Request::from_parts(parts, body);

    let (status, _, _) = send(&fx.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_secret_is_unauthorized() {
    let fx = fixture();
    let (device_id, _secret, _token) = register_device(&fx, "itest-dev-5").await;

    let (status, _, _) = send(
        &fx.app,
        signed_poll(&device_id, "not-the-secret", "{}"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn other_users_cannot_queue() {
    let fx = fixture();
    let (device_id, _secret, _token) = register_device(&fx, "itest-dev-6").await;

    let intruder = mint_token(&fx.config.jwt_secret, "someone-else", 600).unwrap();
    let (status, _, _) = send(
        &fx.app,
        queue_request(&device_id, &intruder, json!({"r": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn device_report_updates_state() {
    let fx = fixture();
    let (device_id, secret, token) = register_device(&fx, "itest-dev-7").await;

    // Device reports a track fix along with its poll.
    let report = json!({
        "t": {"ok": true, "la": 45.5, "lo": -122.6, "al": 12.0, "ti": 1700000000}
    })
    .to_string();
    let (status, _, _) = send(&fx.app, signed_poll(&device_id, &secret, &report)).await;
    assert_eq!(status, StatusCode::OK);

    // The owner sees the new position.
    let req = Request::builder()
        .method("GET")
        .uri(format!("/api/devices/{device_id}"))
        .header(header::HOST, HOST)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let (status, body, _) = send(&fx.app, req).await;
    assert_eq!(status, StatusCode::OK);
    let state: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["position"]["latitude"].as_f64(), Some(45.5));
    assert!(state["last_exchange"].as_i64().unwrap_or(0) > 0);
}

#[tokio::test]
async fn status_endpoint_is_open() {
    let fx = fixture();
    let req = Request::builder()
        .method("GET")
        .uri("/status")
        .header(header::HOST, HOST)
        .body(Body::empty())
        .expect("request");
    let (status, body, _) = send(&fx.app, req).await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["status"].as_str(), Some("ok"));
}
