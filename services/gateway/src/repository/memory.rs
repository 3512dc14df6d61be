//! In-memory route repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use portico_id::RouteId;
use tokio::sync::RwLock;
use tracing::{debug, error};

use super::{RepositoryError, RouteRepository, StatePersistence};
use crate::route::{NewRoute, Route, RoutePatch};

/// Route repository held in memory, optionally mirrored to a state file.
///
/// Mutations take the write lock for their whole duration, so uniqueness
/// checks and the write itself are atomic with respect to each other.
#[derive(Debug, Default)]
pub struct InMemoryRouteRepository {
    routes: RwLock<BTreeMap<RouteId, Route>>,
    persistence: Option<StatePersistence>,
}

impl InMemoryRouteRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository backed by a state file, loading any routes it holds.
    pub fn with_persistence(persistence: StatePersistence) -> anyhow::Result<Self> {
        let state = persistence.load()?;
        Ok(Self {
            routes: RwLock::new(state.routes),
            persistence: Some(persistence),
        })
    }

    /// Creates a repository pre-populated with `routes`. Not persisted.
    pub fn with_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        Self {
            routes: RwLock::new(routes.into_iter().map(|r| (r.id, r)).collect()),
            persistence: None,
        }
    }

    fn persist(&self, routes: &BTreeMap<RouteId, Route>) -> Result<(), RepositoryError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        persistence.save(routes).map_err(|e| {
            error!(error = %e, "Failed to persist route state");
            RepositoryError::Storage(format!("{e:#}"))
        })
    }
}

/// Checks `candidate` against every other stored route.
fn check_unique(
    routes: &BTreeMap<RouteId, Route>,
    candidate: &Route,
) -> Result<(), RepositoryError> {
    for existing in routes.values().filter(|r| r.id != candidate.id) {
        if existing.route_path == candidate.route_path {
            return Err(RepositoryError::Conflict {
                field: "route_path",
                value: candidate.route_path.clone(),
                holder: existing.name.clone(),
            });
        }
        if candidate.check_port != 0 && existing.check_port == candidate.check_port {
            return Err(RepositoryError::Conflict {
                field: "check_port",
                value: candidate.check_port.to_string(),
                holder: existing.name.clone(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl RouteRepository for InMemoryRouteRepository {
    async fn list_active(&self) -> Result<Vec<Route>, RepositoryError> {
        let routes = self.routes.read().await;
        Ok(routes.values().filter(|r| r.is_active).cloned().collect())
    }

    async fn list_all(&self) -> Result<Vec<Route>, RepositoryError> {
        let routes = self.routes.read().await;
        Ok(routes.values().cloned().collect())
    }

    async fn count_by_port(&self, port: u16) -> Result<usize, RepositoryError> {
        let routes = self.routes.read().await;
        Ok(routes.values().filter(|r| r.check_port == port).count())
    }

    async fn find_by_id(&self, id: &RouteId) -> Result<Option<Route>, RepositoryError> {
        Ok(self.routes.read().await.get(id).cloned())
    }

    async fn find_by_check_port(&self, port: u16) -> Result<Option<Route>, RepositoryError> {
        let routes = self.routes.read().await;
        Ok(routes.values().find(|r| r.check_port == port).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<Route>, RepositoryError> {
        let routes = self.routes.read().await;
        Ok(routes.values().filter(|r| r.name == name).cloned().collect())
    }

    async fn find_by_route_path(&self, path: &str) -> Result<Option<Route>, RepositoryError> {
        let routes = self.routes.read().await;
        Ok(routes.values().find(|r| r.route_path == path).cloned())
    }

    async fn create(&self, route: NewRoute) -> Result<Route, RepositoryError> {
        let route = route.validated()?.into_route(Utc::now());

        let mut routes = self.routes.write().await;
        check_unique(&routes, &route)?;

        routes.insert(route.id, route.clone());
        if let Err(e) = self.persist(&routes) {
            routes.remove(&route.id);
            return Err(e);
        }

        debug!(route_id = %route.id, route_path = %route.route_path, "Route created");
        Ok(route)
    }

    async fn update(&self, id: &RouteId, patch: RoutePatch) -> Result<Route, RepositoryError> {
        let mut routes = self.routes.write().await;
        let current = routes
            .get(id)
            .cloned()
            .ok_or(RepositoryError::NotFound(*id))?;

        let (updated, changed) = patch.apply(&current, Utc::now())?;
        if changed.is_empty() {
            return Ok(current);
        }
        check_unique(&routes, &updated)?;

        routes.insert(*id, updated.clone());
        if let Err(e) = self.persist(&routes) {
            routes.insert(*id, current);
            return Err(e);
        }

        debug!(route_id = %id, ?changed, "Route updated");
        Ok(updated)
    }

    async fn delete(&self, id: &RouteId) -> Result<Route, RepositoryError> {
        let mut routes = self.routes.write().await;
        let removed = routes.remove(id).ok_or(RepositoryError::NotFound(*id))?;

        if let Err(e) = self.persist(&routes) {
            routes.insert(*id, removed);
            return Err(e);
        }

        debug!(route_id = %id, "Route deleted");
        Ok(removed)
    }
}
