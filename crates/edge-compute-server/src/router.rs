//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::{any, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminState, build_admin_router};
use crate::handler::{handle_service, health_check, list_services, not_found, readiness_check};
use crate::state::AppState;

/// Admin API configuration for router.
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/admin").
    pub prefix: String,
    /// Admin authentication token.
    pub token: String,
}

/// Build the main application router.
///
/// Routes:
/// - `ANY /services/:id` - Run an exchange against a service's root path
/// - `ANY /services/:id/*path` - Run an exchange with the rest of the path
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - `GET /services` - List registered services
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    build_router_with_admin(state, request_timeout, None)
}

/// Build the main application router with optional Admin API.
pub fn build_router_with_admin(
    state: AppState,
    request_timeout: Duration,
    admin_config: Option<AdminRouterConfig>,
) -> Router {
    let service_routes = Router::new()
        .route("/services/:id", any(handle_service))
        .route("/services/:id/*path", any(handle_service));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/services", get(list_services));

    let mut router = Router::new().merge(service_routes).merge(health_routes);

    if let Some(config) = admin_config {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: config.token,
        };
        router = router.nest(&config.prefix, build_admin_router(admin_state));
    }

    router
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use edge_compute_common::{RuntimeConfig, ServiceEntry, ServiceKind};
    use edge_compute_host::BackendPolicy;
    use tokio::runtime::Handle;
    use tower::util::ServiceExt;

    fn setup_router() -> Router {
        let state = AppState::new(RuntimeConfig::default(), BackendPolicy::none(), Handle::current());
        state
            .register_service(ServiceEntry {
                id: "echo".to_string(),
                kind: ServiceKind::Echo,
                backend: None,
            })
            .unwrap();
        build_router_with_admin(
            state,
            Duration::from_secs(30),
            Some(AdminRouterConfig {
                prefix: "/admin".to_string(),
                token: "secret".to_string(),
            }),
        )
    }

    async fn body_string(response: axum::response::Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = setup_router();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let app = setup_router();

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"services\":1"));
    }

    #[tokio::test]
    async fn test_list_services() {
        let app = setup_router();

        let response = app
            .oneshot(Request::builder().uri("/services").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("echo"));
    }

    #[tokio::test]
    async fn test_service_not_found() {
        let app = setup_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/services/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = setup_router();

        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_service() {
        let app = setup_router();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/services/echo/anything")
                    .header("content-type", "text/plain")
                    .body(Body::from("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(body_string(response).await, "ping");
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let app = setup_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/services")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_lists_services() {
        let app = setup_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/services")
                    .header("X-Admin-Token", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("\"kind\":\"echo\""));
    }
}
