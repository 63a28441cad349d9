//! Request handlers for service exchanges.
//!
//! Each call to a service runs as one exchange on a blocking thread: the
//! exchange core is single-threaded and waits on the host while it has
//! nothing to run. The response head comes back over a channel as soon as
//! the exchange sends it; the body streams after it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::request::downstream_request;
use crate::response::{error as error_response, into_axum_response};
use crate::state::AppState;

/// Largest request body buffered for an exchange.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Run a service exchange for an HTTP request.
///
/// This handler:
/// 1. Looks up the service by id
/// 2. Buffers the request body and builds a host session
/// 3. Dispatches the exchange on a blocking thread
/// 4. Streams the exchange's response back
#[instrument(skip_all, fields(service_id = tracing::field::Empty))]
pub async fn handle_service(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let Some(service_id) = params.get("id").cloned() else {
        return error_response(404, "Service not found");
    };
    tracing::Span::current().record("service_id", service_id.as_str());
    let path = params.get("path").cloned().unwrap_or_default();

    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    info!(
        request_id = %request_id,
        service_id = %service_id,
        "Handling service request"
    );

    let Some(service) = state.get_service(&service_id) else {
        error!(service_id = %service_id, "Service not found");
        return error_response(404, &format!("Service '{service_id}' not found"));
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Failed to read request body");
            return error_response(400, "Failed to read request body");
        }
    };

    let mut downstream = downstream_request(&parts, &path, body);
    if let Some(ConnectInfo(addr)) = connect_info {
        downstream = downstream.with_client_addr(addr.ip());
    }
    let (session, response) = state.session(downstream, &request_id);
    let dispatcher = std::sync::Arc::clone(service.dispatcher());
    let exchange_id = request_id.clone();
    tokio::task::spawn_blocking(move || {
        match dispatcher.run(Rc::new(session), exchange_id.as_str()) {
            Ok(outcome) => info!(
                request_id = %exchange_id,
                state = %outcome.state,
                tasks_run = outcome.metrics.tasks_run,
                duration_ms = start.elapsed().as_millis(),
                "Exchange completed"
            ),
            Err(e) => error!(
                request_id = %exchange_id,
                error = %e,
                duration_ms = start.elapsed().as_millis(),
                "Exchange failed"
            ),
        }
    });

    match response.await {
        Ok(response) => into_axum_response(response),
        Err(_) => {
            error!(request_id = %request_id, "Exchange ended without a response");
            error_response(500, "Internal server error")
        }
    }
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Returns 200 OK if the server is ready to accept requests.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ready",
        "services": state.list_services().len(),
        "backends": state.backends().len(),
    });

    (StatusCode::OK, axum::Json(body))
}

/// List registered services.
pub async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    let services = state.list_services();
    axum::Json(serde_json::json!({
        "services": services,
        "count": services.len(),
    }))
}

/// Fallback for unknown routes.
pub async fn not_found() -> Response<Body> {
    error_response(404, "Not found")
}
