//! Route state persistence.
//!
//! The in-memory repository can mirror its contents to a JSON file so that
//! routes survive restarts. Writes go to a temp file that is renamed into
//! place, so a crash mid-write leaves the previous state intact.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use portico_id::RouteId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::route::Route;

/// Persisted route state file format version.
const STATE_VERSION: u32 = 1;

/// Persisted route state.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    /// Format version.
    pub version: u32,
    /// Routes by ID.
    pub routes: BTreeMap<RouteId, Route>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            routes: BTreeMap::new(),
        }
    }
}

/// State persistence manager.
#[derive(Debug, Clone)]
pub struct StatePersistence {
    state_path: PathBuf,
}

impl StatePersistence {
    pub fn new(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    /// Load state from disk.
    ///
    /// Returns default state if the file doesn't exist or has an unknown
    /// version. A file with an unknown version is moved to
    /// [`StatePersistence::set_aside_path`] first, so the next save cannot
    /// overwrite it. Returns an error if the file exists but cannot be parsed.
    pub fn load(&self) -> Result<PersistedState> {
        if !self.state_path.exists() {
            debug!(path = %self.state_path.display(), "No state file, starting fresh");
            return Ok(PersistedState::default());
        }

        let content = fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read state file: {}", self.state_path.display()))?;

        let state: PersistedState = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse state file: {}", self.state_path.display())
        })?;

        if state.version != STATE_VERSION {
            let aside = self.set_aside_path(state.version);
            fs::rename(&self.state_path, &aside).with_context(|| {
                format!(
                    "Failed to move incompatible state file {} -> {}",
                    self.state_path.display(),
                    aside.display()
                )
            })?;
            warn!(
                file_version = state.version,
                current_version = STATE_VERSION,
                moved_to = %aside.display(),
                "State file version mismatch, starting fresh"
            );
            return Ok(PersistedState::default());
        }

        info!(
            path = %self.state_path.display(),
            route_count = state.routes.len(),
            "Loaded route state from disk"
        );

        Ok(state)
    }

    /// Where a state file written with format `version` is kept once it has
    /// been found incompatible: `routes.json` becomes `routes.json.v{version}`.
    pub fn set_aside_path(&self, version: u32) -> PathBuf {
        let mut name = self.state_path.as_os_str().to_owned();
        name.push(format!(".v{version}"));
        PathBuf::from(name)
    }

    /// Save routes to disk atomically (write temp file, then rename).
    pub fn save(&self, routes: &BTreeMap<RouteId, Route>) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let state = PersistedStateRef {
            version: STATE_VERSION,
            routes,
        };

        let tmp_path = self.state_path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&state).context("Failed to serialize state")?;

        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.state_path.display()
            )
        })?;

        debug!(
            path = %self.state_path.display(),
            route_count = routes.len(),
            "Saved route state to disk"
        );

        Ok(())
    }
}

/// Borrowed form of [`PersistedState`] so saving doesn't clone the map.
#[derive(Serialize)]
struct PersistedStateRef<'a> {
    version: u32,
    routes: &'a BTreeMap<RouteId, Route>,
}
