//! Application state shared across request handlers.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::health::{HealthEvaluator, PortScanner, SharedPortProbe, TcpProber};
use crate::proxy::Dispatcher;
use crate::registry::RouteRegistry;
use crate::repository::SharedRouteRepository;
use crate::routing::{LiveDispatchTable, RouteCompiler, SharedDispatchTable};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    table: SharedDispatchTable,
    compiler: Arc<RouteCompiler>,
    registry: RouteRegistry,
    dispatcher: Dispatcher,
}

impl AppState {
    /// Wires the gateway components for `config` on top of `repository`.
    ///
    /// Probes go over TCP. Use [`AppState::with_prober`] to substitute one.
    pub fn build(config: &Config, repository: SharedRouteRepository) -> Result<Self> {
        Self::with_prober(config, repository, Arc::new(TcpProber))
    }

    pub fn with_prober(
        config: &Config,
        repository: SharedRouteRepository,
        prober: SharedPortProbe,
    ) -> Result<Self> {
        let table: SharedDispatchTable = Arc::new(LiveDispatchTable::new());
        let evaluator = HealthEvaluator::new(
            prober.clone(),
            config.health_check_host.clone(),
            config.probe_timeout,
            config.probe_concurrency,
        );
        let compiler = Arc::new(RouteCompiler::new(
            repository.clone(),
            evaluator,
            table.clone(),
        ));
        let scanner = PortScanner::new(prober, config.probe_timeout, config.discovery_concurrency);
        let registry = RouteRegistry::new(
            repository,
            compiler.clone(),
            scanner,
            config.discovery(),
        );
        let dispatcher = Dispatcher::new(table.clone(), &config.proxy())?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                table,
                compiler,
                registry,
                dispatcher,
            }),
        })
    }

    /// The live dispatch table.
    pub fn table(&self) -> &SharedDispatchTable {
        &self.inner.table
    }

    pub fn compiler(&self) -> &Arc<RouteCompiler> {
        &self.inner.compiler
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}
