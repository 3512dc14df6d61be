//! Errors surfaced to proxied clients.
//!
//! These do not use the admin API's problem-details format: clients of a
//! proxied path get the flat `{ "error", "message", ... }` payloads.

use std::io;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failure talking to a matched backend.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No response headers within the request timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] hyper::Error),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("scheme '{0}' is not supported for upgrades")]
    UnsupportedScheme(String),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout(),
            Self::ConnectTimeout(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RouteNotFound {
    pub error: &'static str,
    pub message: String,
    pub requested_path: String,
}

#[derive(Debug, Serialize)]
pub struct BadGateway {
    pub error: &'static str,
    pub message: String,
    pub target: String,
}

/// A request the dispatcher could not complete.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no route matches {path}")]
    NotFound { path: String },

    #[error("upstream {target} failed: {source}")]
    Upstream {
        target: String,
        #[source]
        source: UpstreamError,
    },
}

impl ProxyError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn upstream(target: impl Into<String>, source: impl Into<UpstreamError>) -> Self {
        Self::Upstream {
            target: target.into(),
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::NotFound { path } => {
                let body = RouteNotFound {
                    error: "Route Not Found",
                    message: format!("No route is registered for path '{path}'"),
                    requested_path: path,
                };
                (status, Json(body)).into_response()
            }
            Self::Upstream { target, source } => {
                let message = if source.is_timeout() {
                    format!("Timed out waiting for {target}")
                } else {
                    format!("Could not reach {target}: {source}")
                };
                let body = BadGateway {
                    error: "Bad Gateway",
                    message,
                    target,
                };
                (status, Json(body)).into_response()
            }
        }
    }
}
