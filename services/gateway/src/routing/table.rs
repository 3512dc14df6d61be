//! Dispatch table and its atomically swappable holder.

use std::cmp::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use portico_id::RouteId;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use super::prefix_matches;
use crate::route::Route;

/// A compiled entry: one reachable route bound to its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchEntry {
    pub route_id: RouteId,
    pub route_path: String,
    #[serde(rename = "target")]
    pub target_url: String,
    #[serde(skip)]
    target: Url,
}

impl DispatchEntry {
    /// Returns `None` if the route's target does not parse.
    pub fn from_route(route: &Route) -> Option<Self> {
        let target = Url::parse(&route.target_url).ok()?;
        Some(Self {
            route_id: route.id,
            route_path: route.route_path.clone(),
            target_url: route.target_url.clone(),
            target,
        })
    }

    /// Parsed backend base URL.
    pub fn target(&self) -> &Url {
        &self.target
    }
}

/// Longest prefix first, ties broken lexicographically.
fn specificity(a: &DispatchEntry, b: &DispatchEntry) -> Ordering {
    b.route_path
        .len()
        .cmp(&a.route_path.len())
        .then_with(|| a.route_path.cmp(&b.route_path))
}

/// Immutable, ordered dispatch table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchTable {
    version: u64,
    entries: Vec<DispatchEntry>,
}

impl DispatchTable {
    /// Builds a table from reachable routes. Routes whose target fails to
    /// parse are skipped.
    pub fn build<'a>(version: u64, routes: impl IntoIterator<Item = &'a Route>) -> Self {
        let mut entries: Vec<DispatchEntry> = routes
            .into_iter()
            .filter_map(|route| {
                let entry = DispatchEntry::from_route(route);
                if entry.is_none() {
                    warn!(
                        route_path = %route.route_path,
                        target_url = %route.target_url,
                        "Skipping route with unparseable target"
                    );
                }
                entry
            })
            .collect();
        entries.sort_by(specificity);
        Self { version, entries }
    }

    /// Version of the snapshot this table was built from. `0` until the
    /// first compile.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> &[DispatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most specific entry matching `path`.
    pub fn lookup(&self, path: &str) -> Option<&DispatchEntry> {
        self.entries
            .iter()
            .find(|entry| prefix_matches(path, &entry.route_path))
    }
}

/// The table currently serving requests.
///
/// Readers get a consistent table without blocking. The compiler replaces
/// the whole table in a single pointer swap; requests already holding the
/// previous table finish against it.
#[derive(Debug, Default)]
pub struct LiveDispatchTable {
    current: ArcSwap<DispatchTable>,
}

impl LiveDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current table.
    pub fn load(&self) -> Arc<DispatchTable> {
        self.current.load_full()
    }

    /// Atomically replaces the current table.
    pub fn publish(&self, table: DispatchTable) {
        let version = table.version;
        let entry_count = table.len();
        self.current.store(Arc::new(table));
        info!(version, entry_count, "Dispatch table published");
    }

    /// Whether any compile has published a table yet.
    pub fn is_ready(&self) -> bool {
        self.current.load().version > 0
    }
}

/// Shared live table reference.
pub type SharedDispatchTable = Arc<LiveDispatchTable>;
