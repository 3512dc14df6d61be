//! Route compilation.
//!
//! A compile reads the active routes, evaluates their health, and publishes
//! a new [`DispatchTable`] built from the reachable ones. The compiler keeps
//! the [`RouteSnapshot`] of its last successful compile; when the routes and
//! their reachability are unchanged the table is left alone.
//!
//! Compiles are single-flight. Every call to [`RouteCompiler::compile`]
//! takes a generation number; a compile records the newest generation it
//! covers before reading the repository, and a caller whose generation is
//! already covered returns without compiling again.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{DispatchTable, SharedDispatchTable};
use crate::health::{HealthCheckedRoute, HealthEvaluator};
use crate::repository::{RepositoryError, SharedRouteRepository};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to read active routes: {0}")]
    Repository(#[from] RepositoryError),
}

/// Active routes and their reachability at a successful compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
    version: u64,
    routes: Vec<HealthCheckedRoute>,
}

impl RouteSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn routes(&self) -> &[HealthCheckedRoute] {
        &self.routes
    }

    /// Whether `routes` describes the same world as this snapshot.
    fn matches(&self, routes: &[HealthCheckedRoute]) -> bool {
        self.routes == routes
    }

    /// Builds the successor snapshot and its table, or `None` if nothing
    /// changed since `previous`.
    pub fn next(
        previous: Option<&RouteSnapshot>,
        routes: Vec<HealthCheckedRoute>,
    ) -> Option<(RouteSnapshot, DispatchTable)> {
        if previous.is_some_and(|p| p.matches(&routes)) {
            return None;
        }

        let version = previous.map_or(1, |p| p.version + 1);
        for ignored in routes.iter().filter(|c| !c.reachable) {
            warn!(
                route_path = %ignored.route.route_path,
                target_url = %ignored.route.target_url,
                check_port = ignored.route.check_port,
                "Route ignored: backend unreachable"
            );
        }
        let table = DispatchTable::build(
            version,
            routes.iter().filter(|c| c.reachable).map(|c| &c.route),
        );

        Some((RouteSnapshot { version, routes }, table))
    }
}

/// Result of a successful [`RouteCompiler::compile`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// A new table was published.
    Rebuilt { version: u64, entries: usize },
    /// The world matched the previous snapshot; the table was kept.
    Unchanged { version: u64 },
    /// A compile that started after this call was requested already ran.
    Coalesced { version: u64 },
}

struct CompilerState {
    snapshot: Option<RouteSnapshot>,
    completed_generation: u64,
}

impl CompilerState {
    fn version(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, RouteSnapshot::version)
    }
}

/// Owns the route snapshot and publishes dispatch tables.
pub struct RouteCompiler {
    repository: SharedRouteRepository,
    evaluator: HealthEvaluator,
    table: SharedDispatchTable,
    requested_generation: AtomicU64,
    state: Mutex<CompilerState>,
}

impl RouteCompiler {
    pub fn new(
        repository: SharedRouteRepository,
        evaluator: HealthEvaluator,
        table: SharedDispatchTable,
    ) -> Self {
        Self {
            repository,
            evaluator,
            table,
            requested_generation: AtomicU64::new(0),
            state: Mutex::new(CompilerState {
                snapshot: None,
                completed_generation: 0,
            }),
        }
    }

    pub fn table(&self) -> &SharedDispatchTable {
        &self.table
    }

    pub fn evaluator(&self) -> &HealthEvaluator {
        &self.evaluator
    }

    /// The snapshot of the last successful compile.
    pub async fn snapshot(&self) -> Option<RouteSnapshot> {
        self.state.lock().await.snapshot.clone()
    }

    /// Recompiles the dispatch table if the routes or their health changed.
    ///
    /// On error the previous table and snapshot stay in place.
    pub async fn compile(&self) -> Result<CompileOutcome, CompileError> {
        let generation = self.requested_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().await;

        if state.completed_generation >= generation {
            debug!(generation, "Compile already covered by a later run");
            return Ok(CompileOutcome::Coalesced {
                version: state.version(),
            });
        }

        let covers = self.requested_generation.load(Ordering::SeqCst);
        let routes = self.repository.list_active().await.map_err(|e| {
            error!(error = %e, "Route compile failed, keeping previous table");
            CompileError::from(e)
        })?;
        let checked = self.evaluator.evaluate(routes).await;

        let outcome = match RouteSnapshot::next(state.snapshot.as_ref(), checked) {
            Some((snapshot, table)) => {
                let version = snapshot.version();
                let entries = table.len();
                self.table.publish(table);
                state.snapshot = Some(snapshot);
                info!(version, entries, "Route table rebuilt");
                CompileOutcome::Rebuilt { version, entries }
            }
            None => {
                debug!(version = state.version(), "Routes unchanged, table kept");
                CompileOutcome::Unchanged {
                    version: state.version(),
                }
            }
        };

        state.completed_generation = covers;
        Ok(outcome)
    }
}

impl std::fmt::Debug for RouteCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteCompiler")
            .field("evaluator", &self.evaluator)
            .field(
                "requested_generation",
                &self.requested_generation.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}
