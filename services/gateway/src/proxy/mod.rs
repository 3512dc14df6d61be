//! Reverse proxy.
//!
//! - [`Dispatcher`]: matches requests against the live table and forwards them
//! - [`forward`]: upstream URL and header construction
//! - [`rewrite`]: HTML base-tag injection with decompression
//! - [`websocket`]: upgrade passthrough

mod dispatcher;
mod error;
pub mod forward;
pub mod rewrite;
pub mod websocket;

pub use dispatcher::{dispatch, Dispatcher, ProxyConfig};
pub use error::{BadGateway, ProxyError, RouteNotFound, UpstreamError};
pub use rewrite::{HtmlRewriter, RewriteError};
