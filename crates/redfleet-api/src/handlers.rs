//! REST API handlers.
//!
//! Each handler calls the gateway and returns JSON in the
//! `{ success, data, error }` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::warn;

use redfleet_reconciler::{CreateRequest, GatewayError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Map a gateway error onto its HTTP status.
fn gateway_error(e: GatewayError) -> axum::response::Response {
    let status = match &e {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::AlreadyExists(_) => StatusCode::CONFLICT,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "gateway request failed");
    }
    error_response(&e.to_string(), status).into_response()
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.gateway.list_instances() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => gateway_error(e),
    }
}

/// POST /api/v1/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Json(req): Json<CreateRequest>,
) -> impl IntoResponse {
    match state.gateway.create_instance(&req) {
        Ok(spec) => (StatusCode::CREATED, ApiResponse::ok(spec)).into_response(),
        Err(e) => gateway_error(e),
    }
}

/// GET /api/v1/instances/{name}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.gateway.describe_instance(&name) {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => gateway_error(e),
    }
}

/// DELETE /api/v1/instances/{name}
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.gateway.delete_instance(&name) {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok("delete requested")).into_response(),
        Err(e) => gateway_error(e),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state.gateway.store();
    let statuses = store.list_statuses().unwrap_or_default();
    let tasks = store.list_tasks().unwrap_or_default();
    let queued = store.list_work_items().map(|w| w.len()).unwrap_or_default();

    let body = crate::prometheus::render_prometheus(&statuses, &tasks, queued);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
