//! Integration tests for edge-compute-server.
//!
//! These tests run a real server against a local origin and verify the
//! complete request path:
//! - Routing to a service and building its session
//! - Dispatching the exchange on a blocking thread
//! - Outbound requests to a registered backend over HTTP
//! - Streaming the exchange's response back to the client
//! - Compressing a response body on the way through
//! - Admin API registration and authentication

use std::net::SocketAddr;

use axum::Router;
use axum::extract::RawQuery;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::runtime::Handle;

use edge_compute_common::{BackendEntry, RuntimeConfig, ServiceEntry, ServiceKind};
use edge_compute_host::BackendPolicy;
use edge_compute_server::{AppState, EdgeServer, TestHandle};

const ADMIN_TOKEN: &str = "test-token";

/// Start a local origin the services forward to.
async fn start_origin() -> SocketAddr {
    let app = Router::new()
        .route("/greet", get(|| async { ([("x-origin", "yes")], "hello from origin") }))
        .route(
            "/query",
            get(|RawQuery(query): RawQuery| async move { query.unwrap_or_default() }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn backend(name: &str, origin: SocketAddr) -> BackendEntry {
    BackendEntry {
        name: name.to_string(),
        url: format!("http://{origin}"),
        override_host: None,
        connect_timeout_ms: Some(1_000),
        first_byte_timeout_ms: Some(5_000),
        between_bytes_timeout_ms: Some(5_000),
    }
}

fn service(id: &str, kind: ServiceKind, backend: Option<&str>) -> ServiceEntry {
    ServiceEntry {
        id: id.to_string(),
        kind,
        backend: backend.map(ToString::to_string),
    }
}

/// Start a server with an `origin` backend and one service of each kind.
async fn start_server() -> TestHandle {
    let origin = start_origin().await;
    let state = AppState::new(RuntimeConfig::default(), BackendPolicy::none(), Handle::current());
    state.register_backend(&backend("origin", origin)).unwrap();
    state
        .register_service(service("site", ServiceKind::Proxy, Some("origin")))
        .unwrap();
    state
        .register_service(service("loud", ServiceKind::Uppercase, Some("origin")))
        .unwrap();
    state
        .register_service(service("echo", ServiceKind::Echo, None))
        .unwrap();
    state
        .register_service(service("packed", ServiceKind::Gzip, Some("origin")))
        .unwrap();

    EdgeServer::start_test(state, Some(ADMIN_TOKEN)).await.unwrap()
}

// ============================================================================
// Test: Health
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_and_ready() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("{}/health", server.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let ready: serde_json::Value = client
        .get(format!("{}/ready", server.url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ready["services"], 4);
    assert_eq!(ready["backends"], 1);

    server.shutdown().await;
}

// ============================================================================
// Test: Proxy Service
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_streams_origin_response() {
    let server = start_server().await;

    let response = reqwest::get(format!("{}/services/site/greet", server.url()))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-origin"], "yes");
    assert_eq!(response.text().await.unwrap(), "hello from origin");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_keeps_query() {
    let server = start_server().await;

    let response = reqwest::get(format!("{}/services/site/query?a=1&b=two", server.url()))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "a=1&b=two");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_origin_status_passed_through() {
    let server = start_server().await;

    let response = reqwest::get(format!("{}/services/site/nowhere", server.url()))
        .await
        .unwrap();

    assert_eq!(response.status(), 404);

    server.shutdown().await;
}

// ============================================================================
// Test: Transform Services
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uppercase_service() {
    let server = start_server().await;

    let response = reqwest::get(format!("{}/services/loud/greet", server.url()))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "HELLO FROM ORIGIN");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gzip_service() {
    use std::io::Read;

    let server = start_server().await;

    let response = reqwest::get(format!("{}/services/packed/greet", server.url()))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    let compressed = response.bytes().await.unwrap();
    let mut body = String::new();
    flate2::read::GzDecoder::new(&compressed[..])
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "hello from origin");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_service() {
    let server = start_server().await;

    let response = reqwest::Client::new()
        .post(format!("{}/services/echo", server.url()))
        .header("content-type", "application/json")
        .body(r#"{"hello":"edge"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.text().await.unwrap(), r#"{"hello":"edge"}"#);

    server.shutdown().await;
}

// ============================================================================
// Test: Missing Services and Backends
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_service() {
    let server = start_server().await;

    let response = reqwest::get(format!("{}/services/nope", server.url()))
        .await
        .unwrap();

    assert_eq!(response.status(), 404);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_backend_fails_exchange() {
    let server = start_server().await;
    assert!(server.state().remove_backend("origin").is_some());

    let response = reqwest::get(format!("{}/services/site/greet", server.url()))
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    assert!(response.text().await.unwrap().is_empty());

    server.shutdown().await;
}

// ============================================================================
// Test: Admin API
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_rejects_bad_token() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let missing = client
        .get(format!("{}/admin/backends", server.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client
        .get(format!("{}/admin/backends", server.url()))
        .header("X-Admin-Token", "not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_registers_backend_and_service() {
    let server = start_server().await;
    let second_origin = start_origin().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/admin/backends", server.url()))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .json(&serde_json::json!({
            "name": "second",
            "url": format!("http://{second_origin}"),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{}/admin/services", server.url()))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .json(&serde_json::json!({
            "id": "second-site",
            "kind": "proxy",
            "backend": "second",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = client
        .get(format!("{}/services/second-site/greet", server.url()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello from origin");

    let listed: serde_json::Value = client
        .get(format!("{}/admin/backends", server.url()))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["count"], 2);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_rejects_service_without_backend() {
    let server = start_server().await;

    let response = reqwest::Client::new()
        .post(format!("{}/admin/services", server.url()))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .json(&serde_json::json!({ "id": "broken", "kind": "uppercase" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert!(server.state().get_service("broken").is_none());

    server.shutdown().await;
}
