//! Prefix routing.
//!
//! The compiler turns the reachable subset of active routes into an
//! immutable [`DispatchTable`] and publishes it through
//! [`LiveDispatchTable`]. Requests read the table lock-free.
//!
//! Prefix semantics: a prefix matches a path when the path equals it or
//! continues with `/` right after it. `/` matches every path.

mod compiler;
mod refresh;
mod table;

pub use compiler::{CompileError, CompileOutcome, RouteCompiler, RouteSnapshot};
pub use refresh::{HealthRefresher, HealthRefresherConfig};
pub use table::{DispatchEntry, DispatchTable, LiveDispatchTable, SharedDispatchTable};

/// Whether `prefix` matches `path` on a segment boundary.
pub fn prefix_matches(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Removes a matched prefix from `path`.
///
/// The remainder keeps its leading `/`. An exact match leaves an empty
/// remainder. Returns `None` if `prefix` does not match.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if !prefix_matches(path, prefix) {
        return None;
    }
    if prefix == "/" {
        return Some(path);
    }
    Some(&path[prefix.len()..])
}
