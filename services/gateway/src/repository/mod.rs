//! Route storage.
//!
//! The gateway reads and writes routes through [`RouteRepository`]. The
//! repository owns the storage-level invariants:
//!
//! - `route_path` is unique among all routes
//! - `check_port` is unique among routes with `check_port != 0`
//! - every stored route passed [`NewRoute::validated`]
//!
//! [`InMemoryRouteRepository`] is the bundled implementation, optionally
//! backed by a JSON state file.

mod memory;
mod persistence;

use std::sync::Arc;

use async_trait::async_trait;
use portico_id::RouteId;
use thiserror::Error;

use crate::route::{NewRoute, Route, RoutePatch, RouteValidationError};

pub use memory::InMemoryRouteRepository;
pub use persistence::{PersistedState, StatePersistence};

/// Repository operation errors.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No route with the given ID.
    #[error("route not found: {0}")]
    NotFound(RouteId),

    /// A uniqueness constraint would be violated.
    #[error("{field} '{value}' is already used by route {holder}")]
    Conflict {
        field: &'static str,
        value: String,
        holder: String,
    },

    /// Input failed validation.
    #[error(transparent)]
    Invalid(#[from] RouteValidationError),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Abstract route store.
#[async_trait]
pub trait RouteRepository: Send + Sync {
    /// Routes with `is_active == true`, ordered by ID.
    async fn list_active(&self) -> Result<Vec<Route>, RepositoryError>;

    /// Every route, ordered by ID.
    async fn list_all(&self) -> Result<Vec<Route>, RepositoryError>;

    /// Number of routes probing `port`.
    async fn count_by_port(&self, port: u16) -> Result<usize, RepositoryError>;

    async fn find_by_id(&self, id: &RouteId) -> Result<Option<Route>, RepositoryError>;

    async fn find_by_check_port(&self, port: u16) -> Result<Option<Route>, RepositoryError>;

    /// Names are labels, not keys, so several routes may share one.
    async fn find_by_name(&self, name: &str) -> Result<Vec<Route>, RepositoryError>;

    async fn find_by_route_path(&self, path: &str) -> Result<Option<Route>, RepositoryError>;

    async fn create(&self, route: NewRoute) -> Result<Route, RepositoryError>;

    async fn update(&self, id: &RouteId, patch: RoutePatch) -> Result<Route, RepositoryError>;

    /// Removes a route, returning what was removed.
    async fn delete(&self, id: &RouteId) -> Result<Route, RepositoryError>;
}

/// Shared repository handle.
pub type SharedRouteRepository = Arc<dyn RouteRepository>;
