//! Health check endpoints.
//!
//! `/healthz` and `/livez` only say the process is up. `/readyz` reports
//! ready once the first route compile has published a table.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "portico-gateway";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "starting".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    /// Dispatch table details, on readiness checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingStatus>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RoutingStatus {
    pub table_version: u64,
    pub route_count: usize,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, routing: Option<RoutingStatus>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        routing,
    }
}

async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Returns 503 until the first compile has completed.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let table = state.table().load();
    let routing = Some(RoutingStatus {
        table_version: table.version(),
        route_count: table.len(),
    });

    if state.table().is_ready() {
        (StatusCode::OK, Json(response("ok", routing)))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response("starting", routing)))
    }
}

async fn livez() -> StatusCode {
    StatusCode::OK
}
