//! Upstream request construction.

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::routing::{strip_prefix, DispatchEntry};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");

/// Connection-scoped headers that must not be forwarded (RFC 9110 §7.6.1).
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("proxy-connection"),
];

/// Content codings the response rewriter can decode.
const DECODABLE_CODINGS: &[&str] = &["gzip", "x-gzip", "deflate", "identity"];

/// Builds `{target}{path minus prefix}{?query}` for a matched entry.
///
/// An exact prefix match keeps the target's own path, or `/` when it has none.
pub fn upstream_url(entry: &DispatchEntry, path: &str, query: Option<&str>) -> Url {
    let remainder = strip_prefix(path, &entry.route_path).unwrap_or(path);
    let mut url = entry.target().clone();

    if !remainder.is_empty() {
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{remainder}"));
    }
    url.set_query(query.filter(|q| !q.is_empty()));
    url
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(listed.iter()) {
        headers.remove(name);
    }
}

/// Where a request came from, for the `X-Forwarded-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct ForwardedFor<'a> {
    pub client_ip: Option<IpAddr>,
    pub route_path: &'a str,
}

/// Headers to send upstream for an inbound request.
///
/// Drops hop-by-hop headers and `Host`, appends the client to
/// `X-Forwarded-For`, and narrows `Accept-Encoding` to decodable codings.
pub fn request_headers(inbound: &HeaderMap, forwarded: ForwardedFor<'_>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    if let Some(ip) = forwarded.client_ip {
        let chain = match inbound
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {ip}", existing.trim()),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }

    if forwarded.route_path != "/" {
        if let Ok(prefix) = HeaderValue::from_str(forwarded.route_path) {
            headers.insert(X_FORWARDED_PREFIX, prefix);
        }
    }

    if let Some(accept) = inbound.get(header::ACCEPT_ENCODING) {
        headers.insert(header::ACCEPT_ENCODING, narrow_accept_encoding(accept));
    }

    headers
}

/// Keeps only the codings in `Accept-Encoding` that can be decoded.
fn narrow_accept_encoding(value: &HeaderValue) -> HeaderValue {
    let kept: Vec<&str> = value
        .to_str()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|item| {
            let coding = item.split(';').next().unwrap_or("").trim();
            DECODABLE_CODINGS
                .iter()
                .any(|c| c.eq_ignore_ascii_case(coding))
        })
        .collect();

    if kept.is_empty() {
        return HeaderValue::from_static("identity");
    }
    HeaderValue::from_str(&kept.join(", ")).unwrap_or(HeaderValue::from_static("identity"))
}

/// Response headers to relay to the client.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);
    headers
}
