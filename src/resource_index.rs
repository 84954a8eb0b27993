//! Resource path resolution
//!
//! Scripts declare auxiliary files (`# wps.resource: ...`) by name. The
//! [`ResourceIndex`] maps each declared [`ResourceHandle`] to one absolute
//! path, trying an absolute name as-is and otherwise each search directory in
//! insertion order. Paths are re-checked on every [`resolve`] so a resource
//! deleted after registration is reported as unavailable instead of being
//! handed out stale.
//!
//! [`resolve`]: ResourceIndex::resolve

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{AlgorithmError, Result};

/// A resource declared by one script
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceHandle {
    pub script_id: String,
    pub name: String,
    /// Whether the outer layer may hand the file out to clients
    pub public: bool,
}

impl ResourceHandle {
    pub fn new(script_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            name: name.into(),
            public: true,
        }
    }

    pub fn private(script_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            public: false,
            ..Self::new(script_id, name)
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.script_id, self.name)
    }
}

/// Declared resources and the search path used to find them
#[derive(Debug, Default, Clone)]
pub struct ResourceIndex {
    search_dirs: Vec<PathBuf>,
    paths: HashMap<ResourceHandle, PathBuf>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a directory to the search path. Relative directories are made
    /// absolute against the process working directory; duplicates are ignored.
    pub fn add_search_directory(&mut self, dir: impl AsRef<Path>) {
        let dir = absolute(dir.as_ref());
        if self.search_dirs.contains(&dir) {
            return;
        }
        if !dir.is_dir() {
            warn!("Resource directory {} does not exist", dir.display());
        }
        self.search_dirs.push(dir);
    }

    pub fn search_directories(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Find `name` on disk: absolute names as-is, relative names in each
    /// search directory in order. First existing path wins.
    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }
        self.search_dirs
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.exists())
    }

    /// Register every handle that resolves. Returns true only if all did;
    /// unresolved handles are left out of the index. Handles already indexed
    /// are looked up again and dropped if they no longer resolve.
    pub fn register_resources(&mut self, handles: &[ResourceHandle]) -> bool {
        let mut all_resolved = true;
        for handle in handles {
            match self.lookup(&handle.name) {
                Some(path) => {
                    debug!("Resource {} -> {}", handle, path.display());
                    self.paths.insert(handle.clone(), path);
                }
                None => {
                    if self.paths.remove(handle).is_some() {
                        debug!("Dropped stale resource {}", handle);
                    }
                    warn!(
                        "Resource '{}' of {} not found in {} search director(y/ies)",
                        handle.name,
                        handle.script_id,
                        self.search_dirs.len()
                    );
                    all_resolved = false;
                }
            }
        }
        all_resolved
    }

    /// Absolute path of a registered resource, re-validated on every call.
    pub fn resolve(&self, handle: &ResourceHandle) -> Result<PathBuf> {
        let path = self.paths.get(handle).ok_or_else(|| AlgorithmError::NotFound {
            what: "Resource",
            id: handle.to_string(),
        })?;
        if path.is_absolute() && is_readable(path) {
            Ok(path.clone())
        } else {
            Err(AlgorithmError::ResourceUnavailable(format!(
                "resource {} not found or broken: {}",
                handle,
                path.display()
            )))
        }
    }

    pub fn is_available(&self, handle: &ResourceHandle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Every handle whose indexed path is `path`. A relative `path` is first
    /// looked up on the search path.
    pub fn referencing_handles(&self, path: &Path) -> Result<BTreeSet<ResourceHandle>> {
        let resolved = if path.is_absolute() {
            path.exists().then(|| path.to_path_buf())
        } else {
            path.to_str().and_then(|name| self.lookup(name))
        };
        let Some(resolved) = resolved else {
            return Err(AlgorithmError::ResourceUnavailable(format!(
                "Resource file not found: {}",
                path.display()
            )));
        };

        let target = canonical(&resolved);
        Ok(self
            .paths
            .iter()
            .filter(|(_, indexed)| canonical(indexed) == target)
            .map(|(handle, _)| handle.clone())
            .collect())
    }

    /// Handles declared by one script, sorted
    pub fn handles_for_script(&self, script_id: &str) -> Vec<ResourceHandle> {
        let mut handles: Vec<ResourceHandle> = self
            .paths
            .keys()
            .filter(|h| h.script_id == script_id)
            .cloned()
            .collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Drop every search directory and every registered handle
    pub fn reset(&mut self) {
        self.search_dirs.clear();
        self.paths.clear();
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_readable(path: &Path) -> bool {
    if path.is_dir() {
        std::fs::read_dir(path).is_ok()
    } else {
        std::fs::File::open(path).is_ok()
    }
}
