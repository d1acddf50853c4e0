//! redfleet-api — REST API for RedFleet.
//!
//! Thin axum layer over the [`Gateway`] contract. Handlers only record
//! desired state; the reconciliation loops do the rest.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/instances` | List all instances |
//! | POST | `/api/v1/instances` | Create an instance |
//! | GET | `/api/v1/instances/{name}` | Get instance status |
//! | DELETE | `/api/v1/instances/{name}` | Request deletion |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod prometheus;

use axum::Router;
use axum::routing::get;
use redfleet_reconciler::Gateway;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Gateway,
}

/// Build the complete API router (REST + health + metrics).
pub fn build_router(gateway: Gateway) -> Router {
    let api_state = ApiState { gateway };

    let api_routes = Router::new()
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{name}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .with_state(api_state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route(
            "/metrics",
            get(handlers::prometheus_metrics).with_state(api_state),
        )
}
