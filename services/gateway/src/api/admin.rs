//! Admin API for managing routes.
//!
//! Every write goes through the [`RouteRegistry`](crate::registry::RouteRegistry),
//! so the dispatch table reflects it by the time the response is sent.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use portico_id::RouteId;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::health::HealthCheckedRoute;
use crate::registry::RouteDraft;
use crate::route::{Route, RoutePatch};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/routes", get(list_routes).post(create_route))
        .route(
            "/routes/{id}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/discover", get(discover_ports))
        .route("/table", get(dispatch_table))
}

#[derive(Debug, Deserialize)]
pub struct ListRoutesQuery {
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub message: String,
    pub route: Route,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn parse_route_id(raw: &str) -> Result<RouteId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::bad_request("invalid_route_id", format!("Invalid route id: {e}")))
}

/// GET /admin/routes
async fn list_routes(
    State(state): State<AppState>,
    Query(query): Query<ListRoutesQuery>,
) -> Result<Json<Vec<HealthCheckedRoute>>, ApiError> {
    let name = query.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let routes = state.registry().list_with_health(name).await?;
    Ok(Json(routes))
}

/// GET /admin/routes/{id}
async fn get_route(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HealthCheckedRoute>, ApiError> {
    let id = parse_route_id(&id)?;
    let route = state
        .registry()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("route_not_found", format!("Route {id} not found")))?;
    let reachable = state.compiler().evaluator().is_reachable(&route).await;
    Ok(Json(HealthCheckedRoute { route, reachable }))
}

/// POST /admin/routes
async fn create_route(
    State(state): State<AppState>,
    Json(draft): Json<RouteDraft>,
) -> Result<Response, ApiError> {
    let route = state.registry().create(draft).await?;
    let body = RouteResponse {
        message: format!("Route '{}' created at {}", route.name, route.route_path),
        route,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// PUT /admin/routes/{id}
async fn update_route(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<RoutePatch>,
) -> Result<Json<RouteResponse>, ApiError> {
    let id = parse_route_id(&id)?;
    let route = state.registry().update(&id, patch).await?;
    Ok(Json(RouteResponse {
        message: format!("Route '{}' updated", route.name),
        route,
    }))
}

/// DELETE /admin/routes/{id}
async fn delete_route(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_route_id(&id)?;
    let route = state.registry().delete(&id).await?;
    Ok(Json(MessageResponse {
        message: format!("Route '{}' deleted", route.name),
    }))
}

/// GET /admin/discover
async fn discover_ports(State(state): State<AppState>) -> Result<Json<Vec<u16>>, ApiError> {
    Ok(Json(state.registry().discover().await?))
}

/// GET /admin/table
async fn dispatch_table(State(state): State<AppState>) -> Response {
    let table = state.table().load();
    Json(table.as_ref()).into_response()
}
