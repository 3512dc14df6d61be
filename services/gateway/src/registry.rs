//! Route registry: the write path for routes.
//!
//! Applies defaults, checks port conflicts, writes to the repository and
//! recompiles the dispatch table before returning. Compile failures are
//! logged by the compiler and do not fail the write.

use std::collections::BTreeSet;
use std::sync::Arc;

use portico_id::RouteId;
use rand::distr::{Alphanumeric, SampleString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::health::{HealthCheckedRoute, PortRange, PortScanner};
use crate::repository::{RepositoryError, SharedRouteRepository};
use crate::route::{NewRoute, Route, RoutePatch, RouteValidationError};
use crate::routing::{CompileOutcome, RouteCompiler};

/// Prefix of auto-generated route paths.
pub const GENERATED_PATH_PREFIX: &str = "/service/";

/// Route creation request. Missing fields are filled in for probed routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteDraft {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub route_path: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub check_port: u16,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Port discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub range: PortRange,
    /// Never reported, in addition to registered check ports.
    pub excluded: BTreeSet<u16>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            range: PortRange::default(),
            excluded: [27017].into_iter().collect(),
        }
    }
}

pub struct RouteRegistry {
    repository: SharedRouteRepository,
    compiler: Arc<RouteCompiler>,
    scanner: PortScanner,
    discovery: DiscoverySettings,
}

impl RouteRegistry {
    pub fn new(
        repository: SharedRouteRepository,
        compiler: Arc<RouteCompiler>,
        scanner: PortScanner,
        discovery: DiscoverySettings,
    ) -> Self {
        Self {
            repository,
            compiler,
            scanner,
            discovery,
        }
    }

    pub fn repository(&self) -> &SharedRouteRepository {
        &self.repository
    }

    fn health_check_host(&self) -> &str {
        self.compiler.evaluator().host()
    }

    fn default_target(&self, port: u16) -> String {
        format!("http://{}:{port}", self.health_check_host())
    }

    /// Creates a route and recompiles.
    pub async fn create(&self, draft: RouteDraft) -> Result<Route, RepositoryError> {
        let name = draft
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| RouteValidationError::new("name", "is required"))?;

        let (route_path, target_url) = if draft.check_port != 0 {
            self.ensure_port_free(draft.check_port, None).await?;
            (
                draft.route_path.unwrap_or_else(generate_route_path),
                draft
                    .target_url
                    .unwrap_or_else(|| self.default_target(draft.check_port)),
            )
        } else {
            let route_path = draft.route_path.ok_or_else(|| {
                RouteValidationError::new("route_path", "is required when check_port is 0")
            })?;
            let target_url = draft.target_url.ok_or_else(|| {
                RouteValidationError::new("target_url", "is required when check_port is 0")
            })?;
            (route_path, target_url)
        };

        let route = self
            .repository
            .create(NewRoute {
                name,
                route_path,
                target_url,
                check_port: draft.check_port,
                is_active: draft.is_active.unwrap_or(true),
            })
            .await?;

        info!(
            route_id = %route.id,
            route_path = %route.route_path,
            target_url = %route.target_url,
            check_port = route.check_port,
            "Route registered"
        );
        self.recompile().await;
        Ok(route)
    }

    /// Applies a partial update and recompiles.
    pub async fn update(&self, id: &RouteId, mut patch: RoutePatch) -> Result<Route, RepositoryError> {
        let current = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or(RepositoryError::NotFound(*id))?;

        if let Some(port) = patch.check_port.filter(|p| *p != 0) {
            if port != current.check_port {
                self.ensure_port_free(port, Some(id)).await?;
                if patch.target_url.is_none() {
                    patch.target_url = Some(self.default_target(port));
                }
            }
        }

        let route = self.repository.update(id, patch).await?;
        info!(route_id = %id, route_path = %route.route_path, "Route updated");
        self.recompile().await;
        Ok(route)
    }

    /// Deletes a route and recompiles.
    pub async fn delete(&self, id: &RouteId) -> Result<Route, RepositoryError> {
        let route = self.repository.delete(id).await?;
        info!(route_id = %id, route_path = %route.route_path, "Route deleted");
        self.recompile().await;
        Ok(route)
    }

    pub async fn get(&self, id: &RouteId) -> Result<Option<Route>, RepositoryError> {
        self.repository.find_by_id(id).await
    }

    /// Every route, or those named `name`, with current reachability.
    pub async fn list_with_health(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<HealthCheckedRoute>, RepositoryError> {
        let routes = match name {
            Some(name) => self.repository.find_by_name(name).await?,
            None => self.repository.list_all().await?,
        };
        Ok(self.compiler.evaluator().evaluate(routes).await)
    }

    /// Open ports on the health-check host that no route probes yet.
    pub async fn discover(&self) -> Result<Vec<u16>, RepositoryError> {
        let mut excluded = self.discovery.excluded.clone();
        excluded.extend(
            self.repository
                .list_all()
                .await?
                .iter()
                .map(|r| r.check_port)
                .filter(|p| *p != 0),
        );

        Ok(self
            .scanner
            .discover(self.health_check_host(), &excluded, self.discovery.range)
            .await)
    }

    /// Recompiles now. A failed compile keeps the current table and is
    /// reported as `None`; the write that triggered it still stands.
    pub async fn recompile(&self) -> Option<CompileOutcome> {
        match self.compiler.compile().await {
            Ok(outcome @ CompileOutcome::Rebuilt { .. }) => Some(outcome),
            Ok(outcome) => {
                debug!(?outcome, "Recompile left the route table as it was");
                Some(outcome)
            }
            Err(e) => {
                debug!(error = %e, "Route write kept, table left for the next compile");
                None
            }
        }
    }

    async fn ensure_port_free(
        &self,
        port: u16,
        except: Option<&RouteId>,
    ) -> Result<(), RepositoryError> {
        if self.repository.count_by_port(port).await? == 0 {
            return Ok(());
        }
        match self.repository.find_by_check_port(port).await? {
            Some(holder) if Some(&holder.id) != except => Err(RepositoryError::Conflict {
                field: "check_port",
                value: port.to_string(),
                holder: holder.name,
            }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("discovery", &self.discovery)
            .finish_non_exhaustive()
    }
}

/// `/service/` followed by eight random lowercase alphanumerics.
fn generate_route_path() -> String {
    let suffix = Alphanumeric.sample_string(&mut rand::rng(), 8).to_lowercase();
    format!("{GENERATED_PATH_PREFIX}{suffix}")
}
