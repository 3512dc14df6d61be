//! WebSocket passthrough.
//!
//! The upgrade request is replayed to the backend over a fresh HTTP/1.1
//! connection. When the backend answers `101 Switching Protocols`, both
//! upgraded connections are joined and bytes are copied until either side
//! closes. Any other backend answer is relayed to the client unchanged.

use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use super::error::UpstreamError;
use super::forward;

/// Whether the request asks to switch to the WebSocket protocol.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));

    connection_upgrade && upgrade_websocket
}

/// Relays an upgrade request to `upstream` and tunnels on success.
///
/// `headers` are the forwarded request headers; the upgrade headers are
/// restored on top of them. Connecting is bounded by `connect_timeout`, the
/// backend's answer to the upgrade by `request_timeout`.
pub async fn tunnel(
    mut request: Request,
    upstream: Url,
    mut headers: HeaderMap,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<Response, UpstreamError> {
    if upstream.scheme() != "http" {
        return Err(UpstreamError::UnsupportedScheme(
            upstream.scheme().to_string(),
        ));
    }
    let host = upstream
        .host_str()
        .ok_or_else(|| UpstreamError::InvalidRequest("target has no host".to_string()))?
        .to_string();
    let port = upstream.port_or_known_default().unwrap_or(80);

    let client_upgrade = hyper::upgrade::on(&mut request);

    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    if let Some(protocol) = request.headers().get(header::UPGRADE) {
        headers.insert(header::UPGRADE, protocol.clone());
    }
    let authority = match upstream.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.clone(),
    };
    let host_value = HeaderValue::from_str(&authority)
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
    headers.insert(header::HOST, host_value);

    let path_and_query = match upstream.query() {
        Some(query) => format!("{}?{query}", upstream.path()),
        None => upstream.path().to_string(),
    };
    let mut backend_request = hyper::Request::builder()
        .method(request.method())
        .uri(path_and_query)
        .body(Body::empty())
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
    *backend_request.headers_mut() = headers;

    let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| UpstreamError::ConnectTimeout(connect_timeout))??;

    let exchange = async {
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!(error = %e, "Upstream upgrade connection closed with error");
            }
        });
        Ok::<_, hyper::Error>(sender.send_request(backend_request).await?)
    };
    let mut backend_response = timeout(request_timeout, exchange)
        .await
        .map_err(|_| UpstreamError::Timeout(request_timeout))??;
    let status = backend_response.status();
    let response_headers = backend_response.headers().clone();

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(upstream = %upstream, %status, "Backend declined WebSocket upgrade");
        let (parts, body) = backend_response.into_parts();
        let mut response = Response::new(Body::new(body));
        *response.status_mut() = parts.status;
        *response.headers_mut() = forward::response_headers(&parts.headers);
        return Ok(response);
    }

    let backend_upgrade = hyper::upgrade::on(&mut backend_response);
    let target = upstream.to_string();
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok((client, backend)) => {
                info!(upstream = %target, "WebSocket tunnel established");
                let mut client = TokioIo::new(client);
                let mut backend = TokioIo::new(backend);
                match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                    Ok((to_backend, to_client)) => {
                        info!(upstream = %target, to_backend, to_client, "WebSocket tunnel closed");
                    }
                    Err(e) => {
                        debug!(upstream = %target, error = %e, "WebSocket tunnel ended with error");
                    }
                }
            }
            Err(e) => {
                warn!(upstream = %target, error = %e, "Failed to upgrade connections");
            }
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = response_headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_upgrade_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade_request(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&headers));
    }
}
