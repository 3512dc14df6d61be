//! HTML response rewriting.
//!
//! Backends mounted under a prefix usually emit root-relative links. A
//! `<base href="{prefix}/">` element in `<head>` makes relative URLs resolve
//! under the prefix without touching the rest of the document.
//!
//! Only `text/html` bodies are touched. Anything that fails to decode is
//! forwarded as it came.

use std::io::{self, Read};

use axum::http::{header, HeaderMap, HeaderValue};
use bytes::{Bytes, BytesMut};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use futures_util::{Stream, StreamExt};
use thiserror::Error;

/// Default upper bound for buffered and decompressed HTML.
pub const DEFAULT_MAX_HTML_BYTES: usize = 8 * 1024 * 1024;

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("content type is not text/html")]
    NotHtml,

    #[error("unsupported content encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("failed to decompress body: {0}")]
    Decompress(#[from] io::Error),

    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("body is not valid UTF-8")]
    InvalidUtf8,
}

/// Whether a `Content-Type` value names an HTML document.
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("text/html"))
}

#[derive(Debug, Clone, Copy)]
pub struct HtmlRewriter {
    max_bytes: usize,
}

impl Default for HtmlRewriter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HTML_BYTES)
    }
}

impl HtmlRewriter {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Decodes `body` and injects a base element for `route_path`.
    ///
    /// The returned bytes are uncompressed UTF-8 HTML.
    pub fn rewrite(
        &self,
        body: &[u8],
        content_type: Option<&str>,
        content_encoding: Option<&str>,
        route_path: &str,
    ) -> Result<Bytes, RewriteError> {
        if !is_html(content_type) {
            return Err(RewriteError::NotHtml);
        }
        if body.len() > self.max_bytes {
            return Err(RewriteError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let decoded = self.decode(body, content_encoding)?;
        let html = std::str::from_utf8(&decoded).map_err(|_| RewriteError::InvalidUtf8)?;

        Ok(Bytes::from(inject_base(html, route_path)))
    }

    fn decode(&self, body: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, RewriteError> {
        let encoding = encoding.map(str::trim).unwrap_or("");
        match encoding.to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(body.to_vec()),
            "gzip" | "x-gzip" => self.read_bounded(MultiGzDecoder::new(body)),
            // "deflate" is meant to be zlib-wrapped, but raw deflate is common.
            "deflate" => self
                .read_bounded(ZlibDecoder::new(body))
                .or_else(|_| self.read_bounded(DeflateDecoder::new(body))),
            other => Err(RewriteError::UnsupportedEncoding(other.to_string())),
        }
    }

    fn read_bounded(&self, reader: impl Read) -> Result<Vec<u8>, RewriteError> {
        let mut out = Vec::new();
        reader
            .take(self.max_bytes as u64 + 1)
            .read_to_end(&mut out)?;
        if out.len() > self.max_bytes {
            return Err(RewriteError::TooLarge {
                limit: self.max_bytes,
            });
        }
        Ok(out)
    }
}

/// Sets the headers of a rewritten HTML body of `len` bytes.
pub fn set_rewritten_headers(headers: &mut HeaderMap, len: usize) {
    headers.remove(header::CONTENT_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(HTML_CONTENT_TYPE),
    );
}

/// Inserts `<base href="{route_path}/">` as the first child of `<head>`.
///
/// Without a `<head>`, one is synthesized after the `<html>` start tag, or
/// after a leading doctype, or at the very start.
pub fn inject_base(html: &str, route_path: &str) -> String {
    let href = if route_path == "/" {
        "/".to_string()
    } else {
        format!("{}/", route_path.trim_end_matches('/'))
    };
    let base = format!(r#"<base href="{}">"#, escape_attr(&href));

    if let Some(at) = start_tag_end(html, "head") {
        return splice(html, at, &base);
    }

    let head = format!("<head>{base}</head>");
    if let Some(at) = start_tag_end(html, "html") {
        return splice(html, at, &head);
    }
    splice(html, doctype_end(html), &head)
}

fn splice(html: &str, at: usize, insert: &str) -> String {
    let mut out = String::with_capacity(html.len() + insert.len());
    out.push_str(&html[..at]);
    out.push_str(insert);
    out.push_str(&html[at..]);
    out
}

/// Byte offset just past the first `<{tag}...>` start tag, case-insensitive.
///
/// Comments and `<script>`/`<style>` contents are skipped, so markup quoted
/// inside them is never matched.
fn start_tag_end(html: &str, tag: &str) -> Option<usize> {
    let lower = html.to_ascii_lowercase();
    let mut at = 0;

    while let Some(found) = lower[at..].find('<') {
        let open = at + found;
        let rest = &lower[open..];

        if rest.starts_with("<!--") {
            at = open + 4 + rest[4..].find("-->")? + 3;
            continue;
        }
        if let Some(raw) = ["script", "style"]
            .into_iter()
            .find(|raw| *raw != tag && opens_tag(rest, raw))
        {
            let close = format!("</{raw}");
            at = open + 1 + rest[1..].find(&close)? + close.len();
            continue;
        }
        if opens_tag(rest, tag) {
            let after = open + 1 + tag.len();
            return lower[after..].find('>').map(|end| after + end + 1);
        }
        // `<header`, `<html5-foo>` and friends.
        at = open + 1;
    }
    None
}

/// Whether `s` starts with `<{name}` followed by `>`, `/` or whitespace.
fn opens_tag(s: &str, name: &str) -> bool {
    let end = name.len() + 1;
    s.get(1..end) == Some(name)
        && s
            .as_bytes()
            .get(end)
            .is_some_and(|c| *c == b'>' || *c == b'/' || c.is_ascii_whitespace())
}

fn doctype_end(html: &str) -> usize {
    let trimmed = html.trim_start();
    let offset = html.len() - trimmed.len();
    let is_doctype = trimmed
        .get(..9)
        .is_some_and(|start| start.eq_ignore_ascii_case("<!doctype"));
    if is_doctype {
        if let Some(end) = trimmed.find('>') {
            return offset + end + 1;
        }
    }
    0
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

/// Result of buffering a body against a size limit.
#[derive(Debug)]
pub enum Buffered {
    /// The whole body, within the limit.
    Complete(Bytes),
    /// The limit was crossed. Holds every chunk read so far; the rest is
    /// still in the stream.
    Overflow(Vec<Bytes>),
}

/// Reads `stream` until it ends or more than `limit` bytes have been read.
pub async fn buffer_within<S, E>(stream: &mut S, limit: usize) -> Result<Buffered, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut chunks = Vec::new();
    let mut total = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        total += chunk.len();
        chunks.push(chunk);
        if total > limit {
            return Ok(Buffered::Overflow(chunks));
        }
    }

    let mut body = BytesMut::with_capacity(total);
    for chunk in chunks {
        body.extend_from_slice(&chunk);
    }
    Ok(Buffered::Complete(body.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use futures_util::stream;
    use rstest::rstest;
    use std::io::Write;

    const PAGE: &str = "<html><head></head><body>hi</body></html>";

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_base_injected_into_head() {
        let out = HtmlRewriter::default()
            .rewrite(PAGE.as_bytes(), Some("text/html"), None, "/service/foo")
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            r#"<html><head><base href="/service/foo/"></head><body>hi</body></html>"#
        );
    }

    #[rstest]
    #[case(
        r#"<HTML><HEAD lang="en"><title>t</title></HEAD></HTML>"#,
        r#"<HTML><HEAD lang="en"><base href="/p/"><title>t</title></HEAD></HTML>"#
    )]
    #[case(
        "<html><body><header>x</header></body></html>",
        r#"<html><head><base href="/p/"></head><body><header>x</header></body></html>"#
    )]
    #[case(
        "<!DOCTYPE html><p>bare</p>",
        r#"<!DOCTYPE html><head><base href="/p/"></head><p>bare</p>"#
    )]
    #[case("<p>bare</p>", r#"<head><base href="/p/"></head><p>bare</p>"#)]
    #[case(
        "<html lang=\"en\"><head/><body></body></html>",
        "<html lang=\"en\"><head/><base href=\"/p/\"><body></body></html>"
    )]
    #[case(
        "<!-- <head> --><html><head><title>t</title></head></html>",
        r#"<!-- <head> --><html><head><base href="/p/"><title>t</title></head></html>"#
    )]
    #[case(
        r#"<html><script>document.write("<head>")</script><head></head></html>"#,
        r#"<html><script>document.write("<head>")</script><head><base href="/p/"></head></html>"#
    )]
    #[case(
        "<style>p::before { content: '<head>' }</style><HEAD></HEAD>",
        r#"<style>p::before { content: '<head>' }</style><HEAD><base href="/p/"></HEAD>"#
    )]
    #[case(
        "<!-- <html> --><p>x</p>",
        r#"<head><base href="/p/"></head><!-- <html> --><p>x</p>"#
    )]
    fn test_inject_base(#[case] html: &str, #[case] expected: &str) {
        assert_eq!(inject_base(html, "/p"), expected);
    }

    #[test]
    fn test_root_route_base() {
        assert_eq!(
            inject_base("<head></head>", "/"),
            r#"<head><base href="/"></head>"#
        );
    }

    #[test]
    fn test_href_is_escaped() {
        assert_eq!(
            inject_base("<head></head>", "/a\"b"),
            r#"<head><base href="/a&quot;b/"></head>"#
        );
    }

    #[test]
    fn test_body_bytes_unchanged_apart_from_base() {
        let page = "<html><head><title>é</title></head><body>héllo wörld</body></html>";
        let out = HtmlRewriter::default()
            .rewrite(page.as_bytes(), Some("text/html; charset=utf-8"), None, "/x")
            .unwrap();
        let out = std::str::from_utf8(&out).unwrap();
        assert_eq!(out.replace(r#"<base href="/x/">"#, ""), page);
    }

    #[test]
    fn test_gzip_body_decompressed() {
        let compressed = gzip(PAGE.as_bytes());
        let out = HtmlRewriter::default()
            .rewrite(&compressed, Some("text/html"), Some("gzip"), "/service/foo")
            .unwrap();
        assert!(std::str::from_utf8(&out)
            .unwrap()
            .contains(r#"<head><base href="/service/foo/"></head>"#));
    }

    #[test]
    fn test_deflate_body_decompressed() {
        let compressed = zlib(PAGE.as_bytes());
        let out = HtmlRewriter::default()
            .rewrite(&compressed, Some("text/html"), Some("deflate"), "/d")
            .unwrap();
        assert!(std::str::from_utf8(&out).unwrap().contains(r#"<base href="/d/">"#));
    }

    #[rstest]
    #[case(Some("application/json"))]
    #[case(Some("text/plain"))]
    #[case(None)]
    fn test_non_html_rejected(#[case] content_type: Option<&str>) {
        let err = HtmlRewriter::default()
            .rewrite(b"{}", content_type, None, "/x")
            .unwrap_err();
        assert!(matches!(err, RewriteError::NotHtml));
    }

    #[test]
    fn test_failures() {
        let rewriter = HtmlRewriter::default();
        assert!(matches!(
            rewriter.rewrite(b"<html>", Some("text/html"), Some("br"), "/x"),
            Err(RewriteError::UnsupportedEncoding(_))
        ));
        assert!(matches!(
            rewriter.rewrite(b"not gzip", Some("text/html"), Some("gzip"), "/x"),
            Err(RewriteError::Decompress(_))
        ));
        assert!(matches!(
            rewriter.rewrite(&[0xff, 0xfe, 0x00], Some("text/html"), None, "/x"),
            Err(RewriteError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_decompression_bomb_bounded() {
        let huge = vec![b'a'; 64 * 1024];
        let compressed = gzip(&huge);
        let err = HtmlRewriter::new(1024)
            .rewrite(&compressed, Some("text/html"), Some("gzip"), "/x")
            .unwrap_err();
        assert!(matches!(err, RewriteError::TooLarge { limit: 1024 }));
    }

    #[test]
    fn test_is_html() {
        assert!(is_html(Some("text/html")));
        assert!(is_html(Some("TEXT/HTML; charset=ISO-8859-1")));
        assert!(!is_html(Some("text/htmlx")));
        assert!(!is_html(Some("application/xhtml+xml")));
    }

    #[test]
    fn test_rewritten_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

        set_rewritten_headers(&mut headers, 42);
        assert!(headers.get(header::CONTENT_ENCODING).is_none());
        assert_eq!(headers[header::CONTENT_LENGTH], "42");
        assert_eq!(headers[header::CONTENT_TYPE], "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_buffer_within_limit() {
        let chunks: Vec<Result<Bytes, io::Error>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let mut body = stream::iter(chunks);
        match buffer_within(&mut body, 4).await.unwrap() {
            Buffered::Complete(bytes) => assert_eq!(&bytes[..], b"abcd"),
            Buffered::Overflow(_) => panic!("expected complete body"),
        }
    }

    #[tokio::test]
    async fn test_buffer_overflow_keeps_rest_in_stream() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
            Ok(Bytes::from_static(b"ghi")),
        ];
        let mut body = stream::iter(chunks);
        let Buffered::Overflow(read) = buffer_within(&mut body, 4).await.unwrap() else {
            panic!("expected overflow");
        };
        assert_eq!(read, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]);
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"ghi"));
    }

    #[tokio::test]
    async fn test_buffer_propagates_stream_error() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        ];
        let mut body = stream::iter(chunks);
        assert!(buffer_within(&mut body, 100).await.is_err());
    }
}
