//! Route value type.
//!
//! A route maps a URL path prefix to a backend base URL. Routes with
//! `check_port == 0` are external: they are never probed and are always
//! considered reachable.
//!
//! Validation lives here and is applied at the repository boundary, so every
//! stored route has a normalized path and a parseable target.

use chrono::{DateTime, Utc};
use portico_id::RouteId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Path prefixes served by the gateway itself. Routes may not claim them.
pub const RESERVED_PREFIXES: &[&str] = &["/admin", "/healthz", "/readyz", "/livez"];

/// A registered route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub name: String,
    pub route_path: String,
    pub target_url: String,
    pub check_port: u16,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// External routes skip health probing and are always reachable.
    pub fn is_external(&self) -> bool {
        self.check_port == 0
    }
}

/// A fully resolved route ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoute {
    pub name: String,
    pub route_path: String,
    pub target_url: String,
    pub check_port: u16,
    pub is_active: bool,
}

impl NewRoute {
    /// Normalizes and validates every field.
    pub fn validated(self) -> Result<Self, RouteValidationError> {
        Ok(Self {
            name: validate_name(&self.name)?,
            route_path: normalize_route_path(&self.route_path)?,
            target_url: validate_target_url(&self.target_url)?,
            check_port: self.check_port,
            is_active: self.is_active,
        })
    }

    pub(crate) fn into_route(self, now: DateTime<Utc>) -> Route {
        Route {
            id: RouteId::new(),
            name: self.name,
            route_path: self.route_path,
            target_url: self.target_url,
            check_port: self.check_port,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a stored route. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoutePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub route_path: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub check_port: Option<u16>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl RoutePatch {
    /// Applies the patch to a copy of `route`, validating changed fields.
    ///
    /// Returns the updated route and the list of fields that actually changed.
    pub fn apply(
        &self,
        route: &Route,
        now: DateTime<Utc>,
    ) -> Result<(Route, Vec<&'static str>), RouteValidationError> {
        let mut updated = route.clone();
        let mut changed = Vec::new();

        if let Some(name) = &self.name {
            let name = validate_name(name)?;
            if name != updated.name {
                updated.name = name;
                changed.push("name");
            }
        }

        if let Some(path) = &self.route_path {
            let path = normalize_route_path(path)?;
            if path != updated.route_path {
                updated.route_path = path;
                changed.push("route_path");
            }
        }

        if let Some(target) = &self.target_url {
            let target = validate_target_url(target)?;
            if target != updated.target_url {
                updated.target_url = target;
                changed.push("target_url");
            }
        }

        if let Some(port) = self.check_port {
            if port != updated.check_port {
                updated.check_port = port;
                changed.push("check_port");
            }
        }

        if let Some(active) = self.is_active {
            if active != updated.is_active {
                updated.is_active = active;
                changed.push("is_active");
            }
        }

        if !changed.is_empty() {
            updated.updated_at = now;
        }

        Ok((updated, changed))
    }
}

/// Field-level validation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct RouteValidationError {
    pub field: &'static str,
    pub message: String,
}

impl RouteValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

fn validate_name(name: &str) -> Result<String, RouteValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RouteValidationError::new("name", "must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Normalize a route path.
///
/// - Leading `/` added when missing
/// - Trailing `/` removed, except for the root path
/// - Query, fragment, whitespace and empty segments rejected
/// - Reserved gateway prefixes rejected
pub fn normalize_route_path(raw: &str) -> Result<String, RouteValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RouteValidationError::new("route_path", "must not be empty"));
    }

    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c == '?' || c == '#')
    {
        return Err(RouteValidationError::new(
            "route_path",
            "must not contain whitespace, '?' or '#'",
        ));
    }

    let mut path = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };

    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    if path.contains("//") {
        return Err(RouteValidationError::new(
            "route_path",
            "must not contain empty segments",
        ));
    }

    if let Some(reserved) = RESERVED_PREFIXES
        .iter()
        .find(|reserved| crate::routing::prefix_matches(&path, reserved))
    {
        return Err(RouteValidationError::new(
            "route_path",
            format!("'{reserved}' is reserved by the gateway"),
        ));
    }

    Ok(path)
}

/// Validate a backend base URL. Only absolute http(s) URLs with a host are accepted.
pub fn validate_target_url(raw: &str) -> Result<String, RouteValidationError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| RouteValidationError::new("target_url", e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(RouteValidationError::new(
            "target_url",
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }

    if url.host_str().is_none() {
        return Err(RouteValidationError::new("target_url", "missing host"));
    }

    if url.query().is_some() || url.fragment().is_some() {
        return Err(RouteValidationError::new(
            "target_url",
            "must not carry a query or fragment",
        ));
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn new_route(path: &str, target: &str, port: u16) -> NewRoute {
        NewRoute {
            name: "svc".to_string(),
            route_path: path.to_string(),
            target_url: target.to_string(),
            check_port: port,
            is_active: true,
        }
    }

    #[rstest]
    #[case("service/foo", "/service/foo")]
    #[case("/service/foo/", "/service/foo")]
    #[case("  /api  ", "/api")]
    #[case("/", "/")]
    #[case("///", "/")]
    fn test_normalize_route_path(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_route_path(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("/a b")]
    #[case("/a?x=1")]
    #[case("/a//b")]
    #[case("/admin")]
    #[case("/admin/routes")]
    #[case("/healthz")]
    fn test_normalize_route_path_rejects(#[case] raw: &str) {
        let err = normalize_route_path(raw).unwrap_err();
        assert_eq!(err.field, "route_path");
    }

    #[test]
    fn test_reserved_prefix_is_segment_aware() {
        assert_eq!(
            normalize_route_path("/administration").unwrap(),
            "/administration"
        );
    }

    #[test]
    fn test_validate_target_url() {
        assert_eq!(
            validate_target_url("http://127.0.0.1:3001/").unwrap(),
            "http://127.0.0.1:3001"
        );
        assert_eq!(
            validate_target_url("https://api.example.com/v1").unwrap(),
            "https://api.example.com/v1"
        );
        assert!(validate_target_url("ftp://example.com").is_err());
        assert!(validate_target_url("not a url").is_err());
        assert!(validate_target_url("http://example.com/?q=1").is_err());
    }

    #[test]
    fn test_new_route_validated_trims_name() {
        let mut route = new_route("svc", "http://localhost:3000", 3000);
        route.name = "  Products  ".to_string();
        let validated = route.validated().unwrap();
        assert_eq!(validated.name, "Products");
        assert_eq!(validated.route_path, "/svc");
    }

    #[test]
    fn test_new_route_rejects_blank_name() {
        let mut route = new_route("/svc", "http://localhost:3000", 3000);
        route.name = "   ".to_string();
        assert_eq!(route.validated().unwrap_err().field, "name");
    }

    #[test]
    fn test_patch_tracks_changed_fields() {
        let now = Utc::now();
        let route = new_route("/svc", "http://localhost:3000", 3000)
            .validated()
            .unwrap()
            .into_route(now);

        let patch = RoutePatch {
            name: Some("svc".to_string()),
            check_port: Some(3001),
            target_url: Some("http://localhost:3001".to_string()),
            ..Default::default()
        };

        let later = now + chrono::Duration::seconds(5);
        let (updated, changed) = patch.apply(&route, later).unwrap();
        assert_eq!(changed, vec!["target_url", "check_port"]);
        assert_eq!(updated.check_port, 3001);
        assert_eq!(updated.updated_at, later);
        assert_eq!(updated.created_at, now);
    }

    #[test]
    fn test_empty_patch_keeps_timestamp() {
        let now = Utc::now();
        let route = new_route("/svc", "http://localhost:3000", 3000)
            .validated()
            .unwrap()
            .into_route(now);

        let (updated, changed) = RoutePatch::default()
            .apply(&route, now + chrono::Duration::seconds(1))
            .unwrap();
        assert!(changed.is_empty());
        assert_eq!(updated, route);
    }
}
