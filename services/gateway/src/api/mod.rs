//! HTTP surface: admin API, health endpoints, and the proxy fallback.

mod admin;
pub mod error;
mod health;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use portico_id::RequestId;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId as RequestIdHeader, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::proxy;
use crate::state::AppState;

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Issues a `req_<ulid>` id to requests that arrive without one.
#[derive(Debug, Clone, Copy, Default)]
struct MakeUlidRequestId;

impl MakeRequestId for MakeUlidRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestIdHeader> {
        RequestId::new()
            .to_string()
            .parse()
            .ok()
            .map(RequestIdHeader::new)
    }
}

/// Create the gateway router.
///
/// `/admin` and the health endpoints are served locally; every other path
/// goes to the dispatcher.
pub fn create_router(state: AppState) -> Router {
    // CORS applies to the admin API only; proxied responses keep backend headers.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/admin", admin::routes().layer(cors))
        .fallback(proxy::dispatch)
        // Middleware
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeUlidRequestId))
        // Application state
        .with_state(state)
}
