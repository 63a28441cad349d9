//! Admin API handlers for runtime management.
//!
//! This module provides HTTP handlers for managing the backends and
//! services a running server exposes.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header
//! to match the configured admin token.
//!
//! # Endpoints
//!
//! - `GET /admin/backends` - List registered backends
//! - `POST /admin/backends` - Register (or replace) an HTTP backend
//! - `DELETE /admin/backends/:name` - Remove a backend
//! - `GET /admin/services` - List services (detailed)
//! - `POST /admin/services` - Register (or replace) a service
//! - `DELETE /admin/services/:id` - Remove a service

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get},
};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use edge_compute_common::{BackendEntry, ServiceEntry, ServiceKind};

use crate::state::AppState;

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    /// Application state (backends, services).
    pub app_state: AppState,
    /// Expected admin token for authentication.
    pub admin_token: String,
}

/// Backend information for API responses.
#[derive(Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub target: String,
    /// Registered by an exchange at run time rather than by config.
    pub dynamic: bool,
}

/// Service information for API responses.
#[derive(Serialize)]
pub struct ServiceInfo {
    pub id: String,
    pub kind: ServiceKind,
    pub backend: Option<String>,
}

/// Build the Admin API router.
///
/// Returns a router that uses Extension to pass the admin state,
/// allowing it to be nested into routers with different state types.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/backends", get(list_backends).post(register_backend))
        .route("/backends/:name", delete(delete_backend))
        .route("/services", get(list_services_admin).post(register_service))
        .route("/services/:id", delete(delete_service))
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
///
/// The comparison runs in constant time over the token bytes.
fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), (StatusCode, &'static str)> {
    match headers.get("X-Admin-Token") {
        Some(token) => {
            if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
                Ok(())
            } else {
                Err((StatusCode::UNAUTHORIZED, "Invalid admin token"))
            }
        }
        None => Err((StatusCode::UNAUTHORIZED, "Missing X-Admin-Token header")),
    }
}

/// List registered backends.
///
/// # Response
///
/// ```json
/// {
///   "backends": [{ "name": "origin", "target": "http://127.0.0.1:9000", "dynamic": false }],
///   "count": 1
/// }
/// ```
#[instrument(skip_all)]
pub async fn list_backends(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let backends: Vec<BackendInfo> = admin_state
        .app_state
        .backends()
        .list()
        .into_iter()
        .map(|backend| BackendInfo {
            name: backend.name,
            target: backend.target,
            dynamic: backend.dynamic,
        })
        .collect();
    let count = backends.len();

    Json(serde_json::json!({
        "backends": backends,
        "count": count
    }))
    .into_response()
}

/// Register an HTTP backend.
///
/// # Request
///
/// `POST /admin/backends` with a JSON body:
///
/// ```json
/// { "name": "origin", "url": "http://127.0.0.1:9000", "connect_timeout_ms": 500 }
/// ```
#[instrument(skip_all)]
pub async fn register_backend(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Json(entry): Json<BackendEntry>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    match admin_state.app_state.register_backend(&entry) {
        Ok(()) => Json(serde_json::json!({
            "name": entry.name,
            "message": "Backend registered successfully"
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Backend registration failed");
            (StatusCode::BAD_REQUEST, format!("Invalid backend: {e}")).into_response()
        }
    }
}

/// Remove a backend.
///
/// Services forwarding to it keep their entry; their exchanges fail with
/// a missing-backend error until a backend of that name is registered again.
#[instrument(skip(admin_state, headers))]
pub async fn delete_backend(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    match admin_state.app_state.remove_backend(&name) {
        Some(_) => {
            info!(backend = %name, "Backend removed");
            Json(serde_json::json!({
                "name": name,
                "message": "Backend deleted successfully"
            }))
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, format!("Backend not found: {name}")).into_response(),
    }
}

/// List all services (detailed).
#[instrument(skip_all)]
pub async fn list_services_admin(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let services: Vec<ServiceInfo> = admin_state
        .app_state
        .list_services()
        .into_iter()
        .filter_map(|id| admin_state.app_state.get_service(&id))
        .map(|service| ServiceInfo {
            id: service.entry.id,
            kind: service.entry.kind,
            backend: service.entry.backend,
        })
        .collect();
    let count = services.len();

    Json(serde_json::json!({
        "services": services,
        "count": count
    }))
    .into_response()
}

/// Register a service.
///
/// # Request
///
/// `POST /admin/services` with a JSON body:
///
/// ```json
/// { "id": "site", "kind": "proxy", "backend": "origin" }
/// ```
#[instrument(skip_all)]
pub async fn register_service(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Json(entry): Json<ServiceEntry>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let id = entry.id.clone();
    match admin_state.app_state.register_service(entry) {
        Ok(()) => Json(serde_json::json!({
            "id": id,
            "message": "Service registered successfully"
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Service registration failed");
            (StatusCode::BAD_REQUEST, format!("Invalid service: {e}")).into_response()
        }
    }
}

/// Remove a service.
#[instrument(skip(admin_state, headers))]
pub async fn delete_service(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    match admin_state.app_state.remove_service(&id) {
        Some(_) => {
            info!(service = %id, "Service removed");
            Json(serde_json::json!({
                "id": id,
                "message": "Service deleted successfully"
            }))
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, format!("Service not found: {id}")).into_response(),
    }
}
