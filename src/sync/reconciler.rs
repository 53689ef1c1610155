//! Path relevance filtering for the batch scheduler.
//!
//! Each [`SubPathReconciler`] claims the paths it cares about out of the
//! shared event stream and handles them when a batch fires.

use std::path::{Path, PathBuf};

use tracing::trace;

use super::error::{Result, SyncError};
use super::events::FileSystemEvent;
use super::notice::Notice;

/// Sub-paths never synced: VCS metadata and dependency caches
pub const DEFAULT_EXCLUDED_SUBPATHS: &[&str] =
    &[".git/", "node_modules/", ".venv/", "build/", "dist/", ".claude/"];

pub trait SubPathReconciler: Send {
    /// Unique among the reconcilers registered with one scheduler
    fn tag(&self) -> &str;

    fn is_relevant_subpath(&mut self, path: &Path) -> bool;

    fn dirs_to_watch(&self) -> Vec<PathBuf> {
        let mut dirs = self.local_dirs_to_watch();
        dirs.extend(self.environment_dirs_to_watch());
        dirs
    }

    fn local_dirs_to_watch(&self) -> Vec<PathBuf>;

    /// Sandbox-side directories, fed by the remote bridge
    fn environment_dirs_to_watch(&self) -> Vec<PathBuf>;

    /// Pause notices block the next batch; warnings ride along with it
    fn notices(&mut self) -> Vec<Notice> {
        Vec::new()
    }

    /// Called with this reconciler's share of a batch. Returning
    /// [`SyncError::NewNotices`] pauses the scheduler with those notices.
    fn handle_path_changes(&mut self, paths: &[PathBuf]) -> Result<()>;
}

/// Filters paths strictly under any of a set of roots, minus excluded
/// sub-paths resolved against every root.
#[derive(Debug, Clone)]
pub struct MultiRootReconciler {
    roots: Vec<PathBuf>,
    excluded_absolute: Vec<PathBuf>,
}

impl MultiRootReconciler {
    pub fn new(roots: Vec<PathBuf>, excluded_subpaths: &[PathBuf]) -> Result<Self> {
        if let Some(root) = roots.iter().find(|root| !root.is_absolute()) {
            return Err(SyncError::Configuration(format!(
                "root path {} must be absolute",
                root.display()
            )));
        }
        if let Some(subpath) = excluded_subpaths.iter().find(|p| p.is_absolute()) {
            return Err(SyncError::Configuration(format!(
                "excluded sub-path {} must be relative so it can be resolved against every root",
                subpath.display()
            )));
        }
        if excluded_subpaths.is_empty() {
            return Err(SyncError::Configuration(
                "at least one excluded sub-path is required".to_string(),
            ));
        }

        let excluded_absolute = excluded_subpaths
            .iter()
            .flat_map(|subpath| roots.iter().map(move |root| root.join(subpath)))
            .collect();
        Ok(Self {
            roots,
            excluded_absolute,
        })
    }

    pub fn with_default_exclusions(roots: Vec<PathBuf>) -> Result<Self> {
        Self::new(roots, &default_excluded_subpaths())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Roots as configured, never expanded
    pub fn dirs_to_watch(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }

    /// Roots themselves are never relevant; changes count at leaf level
    pub fn is_relevant_subpath(&self, path: &Path) -> bool {
        if self.roots.iter().any(|root| root == path) {
            trace!(path = %path.display(), "Ignoring root directory event");
            return false;
        }
        if !is_path_under_any(path, &self.roots) {
            return false;
        }
        !is_path_under_any(path, &self.excluded_absolute)
    }
}

pub fn default_excluded_subpaths() -> Vec<PathBuf> {
    DEFAULT_EXCLUDED_SUBPATHS.iter().map(PathBuf::from).collect()
}

pub fn is_path_under_any(path: &Path, search_paths: &[PathBuf]) -> bool {
    search_paths.iter().any(|search| path.starts_with(search))
}

/// Drop paths nested in other paths so each tree is registered once
pub fn simplify_root_watcher_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut shortest_first: Vec<&PathBuf> = paths.iter().collect();
    shortest_first.sort_by_key(|path| path.components().count());

    let mut simplified: Vec<PathBuf> = Vec::new();
    for path in shortest_first {
        if is_path_under_any(path, &simplified) {
            continue;
        }
        simplified.push(path.clone());
    }
    simplified
}

pub fn extract_touched_paths(event: &FileSystemEvent) -> Vec<PathBuf> {
    event
        .touched_paths()
        .into_iter()
        .map(Path::to_path_buf)
        .collect()
}
