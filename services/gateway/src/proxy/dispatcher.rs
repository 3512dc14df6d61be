//! Request dispatch.
//!
//! Every request that is not an admin or health endpoint lands here. The
//! dispatcher matches it against the live table, forwards it to the matched
//! backend, and relays the answer, rewriting HTML on the way back.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{stream, StreamExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::{ProxyError, UpstreamError};
use super::forward::{self, ForwardedFor};
use super::rewrite::{self, Buffered, HtmlRewriter};
use super::websocket;
use crate::routing::SharedDispatchTable;
use crate::state::AppState;

/// Upstream transport settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_html_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            max_html_bytes: rewrite::DEFAULT_MAX_HTML_BYTES,
        }
    }
}

pub struct Dispatcher {
    table: SharedDispatchTable,
    client: reqwest::Client,
    rewriter: HtmlRewriter,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(table: SharedDispatchTable, config: &ProxyConfig) -> Result<Self> {
        // Redirects and proxies are the backend's and the client's business.
        // `request_timeout` bounds the wait for response headers (in
        // `dispatch`) and each idle read, never the whole body.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            table,
            client,
            rewriter: HtmlRewriter::new(config.max_html_bytes),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        })
    }

    /// Serves one request. Failures become 404/502 responses.
    pub async fn handle(&self, request: Request) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    ProxyError::NotFound { .. } => {
                        debug!(%method, %path, "No route matched");
                    }
                    ProxyError::Upstream { target, source } => {
                        warn!(%method, %path, target_url = %target, error = %source, "Upstream request failed");
                    }
                }
                e.into_response()
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response, ProxyError> {
        let table = self.table.load();
        let path = request.uri().path();
        let entry = table
            .lookup(path)
            .ok_or_else(|| ProxyError::not_found(path))?;

        let url = forward::upstream_url(entry, path, request.uri().query());
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let headers = forward::request_headers(
            request.headers(),
            ForwardedFor {
                client_ip,
                route_path: &entry.route_path,
            },
        );

        debug!(
            route_path = %entry.route_path,
            upstream = %url,
            method = %request.method(),
            "Dispatching request"
        );

        if websocket::is_upgrade_request(request.headers()) {
            return websocket::tunnel(
                request,
                url,
                headers,
                self.connect_timeout,
                self.request_timeout,
            )
            .await
            .map_err(|e| ProxyError::upstream(&entry.target_url, e));
        }

        let (parts, body) = request.into_parts();
        let skip_rewrite = parts.method == Method::HEAD;

        let mut upstream = self.client.request(parts.method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let response = timeout(self.request_timeout, upstream.send())
            .await
            .map_err(|_| {
                ProxyError::upstream(&entry.target_url, UpstreamError::Timeout(self.request_timeout))
            })?
            .map_err(|e| ProxyError::upstream(&entry.target_url, e))?;

        self.relay(response, &entry.route_path, &entry.target_url, skip_rewrite)
            .await
    }

    async fn relay(
        &self,
        upstream: reqwest::Response,
        route_path: &str,
        target: &str,
        skip_rewrite: bool,
    ) -> Result<Response, ProxyError> {
        let status = upstream.status();
        let mut headers = forward::response_headers(upstream.headers());

        let content_type = header_str(&headers, header::CONTENT_TYPE);
        let wants_rewrite =
            !skip_rewrite && has_body(status) && rewrite::is_html(content_type.as_deref());
        let declared_len = header_str(&headers, header::CONTENT_LENGTH)
            .and_then(|len| len.parse::<usize>().ok());
        let within_budget = declared_len.is_none_or(|len| len <= self.rewriter.max_bytes());

        if !wants_rewrite || !within_budget {
            return Ok(build_response(
                status,
                headers,
                Body::from_stream(upstream.bytes_stream()),
            ));
        }

        let content_encoding = header_str(&headers, header::CONTENT_ENCODING);
        let mut body_stream = Box::pin(upstream.bytes_stream());
        let buffered = rewrite::buffer_within(&mut body_stream, self.rewriter.max_bytes())
            .await
            .map_err(|e| ProxyError::upstream(target, e))?;

        let body = match buffered {
            Buffered::Complete(original) => match self.rewriter.rewrite(
                &original,
                content_type.as_deref(),
                content_encoding.as_deref(),
                route_path,
            ) {
                Ok(rewritten) => {
                    rewrite::set_rewritten_headers(&mut headers, rewritten.len());
                    Body::from(rewritten)
                }
                Err(e) => {
                    debug!(route_path, error = %e, "HTML rewrite skipped, forwarding original");
                    Body::from(original)
                }
            },
            Buffered::Overflow(chunks) => {
                debug!(route_path, "HTML body over budget, forwarding original");
                let read = stream::iter(chunks.into_iter().map(Ok::<_, reqwest::Error>));
                Body::from_stream(read.chain(body_stream))
            }
        };

        Ok(build_response(status, headers, body))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("rewriter", &self.rewriter)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Axum fallback handler.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    state.dispatcher().handle(request).await
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use crate::routing::{DispatchTable, LiveDispatchTable};
    use axum::body::to_bytes;
    use chrono::Utc;
    use portico_id::RouteId;
    use std::sync::Arc;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn route(route_path: &str, target: &str) -> Route {
        let now = Utc::now();
        Route {
            id: RouteId::new(),
            name: "svc".to_string(),
            route_path: route_path.to_string(),
            target_url: target.to_string(),
            check_port: 0,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn dispatcher(routes: &[Route]) -> Dispatcher {
        dispatcher_with(routes, ProxyConfig::default())
    }

    fn dispatcher_with(routes: &[Route], config: ProxyConfig) -> Dispatcher {
        let table = Arc::new(LiveDispatchTable::new());
        table.publish(DispatchTable::build(1, routes));
        Dispatcher::new(table, &config).unwrap()
    }

    fn short_timeouts() -> ProxyConfig {
        ProxyConfig {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(400),
            ..ProxyConfig::default()
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let d = dispatcher(&[]);
        let response = d.handle(get("/unregistered/path")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Route Not Found");
        assert_eq!(json["requested_path"], "/unregistered/path");
    }

    #[tokio::test]
    async fn test_prefix_stripped_and_headers_forwarded() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items/7"))
            .and(header_eq("x-forwarded-prefix", "/service/shop"))
            .and(header_eq("x-forwarded-proto", "http"))
            .respond_with(ResponseTemplate::new(200).set_body_string("item 7"))
            .mount(&backend)
            .await;

        let d = dispatcher(&[route("/service/shop", &backend.uri())]);
        let response = d.handle(get("/service/shop/items/7")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"item 7");
    }

    #[tokio::test]
    async fn test_upstream_status_relayed() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(418).insert_header("x-backend", "yes"))
            .mount(&backend)
            .await;

        let d = dispatcher(&[route("/tea", &backend.uri())]);
        let response = d.handle(get("/tea/pot")).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers()["x-backend"], "yes");
    }

    #[tokio::test]
    async fn test_html_rewritten() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><head></head><body>hi</body></html>", "text/html"),
            )
            .mount(&backend)
            .await;

        let d = dispatcher(&[route("/service/foo", &backend.uri())]);
        let response = d.handle(get("/service/foo/")).await;
        let length: usize = response.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), length);
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"<html><head><base href="/service/foo/"></head><body>hi</body></html>"#
        );
    }

    #[tokio::test]
    async fn test_head_request_not_rewritten() {
        let backend = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html"))
            .mount(&backend)
            .await;

        let d = dispatcher(&[route("/p", &backend.uri())]);
        let request = Request::builder()
            .method(Method::HEAD)
            .uri("/p")
            .body(Body::empty())
            .unwrap();
        let response = d.handle(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let d = dispatcher(&[route("/gone", &target)]);
        let response = d.handle(get("/gone/x")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Bad Gateway");
        assert_eq!(json["target"], target.as_str());
    }

    #[tokio::test]
    async fn test_post_body_streamed() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(wiremock::matchers::body_string("payload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&backend)
            .await;

        let d = dispatcher(&[route("/api", &backend.uri())]);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/echo")
            .header(header::CONTENT_LENGTH, "7")
            .body(Body::from("payload"))
            .unwrap();
        let response = d.handle(request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_slow_response_headers_are_502() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&backend)
            .await;

        let d = dispatcher_with(&[route("/slow", &backend.uri())], short_timeouts());
        let response = tokio::time::timeout(Duration::from_secs(2), d.handle(get("/slow/x")))
            .await
            .expect("handler must give up at the request timeout");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = json_body(response).await;
        assert!(json["message"].as_str().unwrap().starts_with("Timed out"));
    }

    #[tokio::test]
    async fn test_streamed_body_may_outlast_request_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\n")
                .await
                .unwrap();
            // Each gap is under the request timeout; the total is well over it.
            for byte in b"hello" {
                tokio::time::sleep(Duration::from_millis(150)).await;
                stream.write_all(&[*byte]).await.unwrap();
            }
        });

        let d = dispatcher_with(&[route("/stream", &target)], short_timeouts());
        let response = d.handle(get("/stream/feed")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_silent_upgrade_backend_is_502() {
        // Bound but never accepting: the connect completes, no answer ever comes.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("http://{}", listener.local_addr().unwrap());

        let d = dispatcher_with(&[route("/ws", &target)], short_timeouts());
        let request = Request::builder()
            .uri("/ws/chat")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), d.handle(request))
            .await
            .expect("upgrade must give up at the request timeout");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = json_body(response).await;
        assert_eq!(json["target"], target.as_str());
        assert!(json["message"].as_str().unwrap().starts_with("Timed out"));
        drop(listener);
    }

    #[test]
    fn test_has_body() {
        assert!(has_body(StatusCode::OK));
        assert!(!has_body(StatusCode::NO_CONTENT));
        assert!(!has_body(StatusCode::NOT_MODIFIED));
        assert!(!has_body(StatusCode::SWITCHING_PROTOCOLS));
    }
}
