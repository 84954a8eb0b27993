//! Script discovery and identity
//!
//! The [`ScriptRepository`] owns one [`ScriptDescriptor`] per registered
//! script file. A script's public identifier is derived from its file name
//! alone (`<prefix><sanitized stem>`), so re-scanning the same tree always
//! yields the same identifiers. Two different files deriving the same
//! identifier is an error, never a silent replacement.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::annotation::{Annotation, AnnotationType, MetadataParser};
use crate::description::ProcessDescription;
use crate::error::{AlgorithmError, Result};
use crate::resource_index::{ResourceHandle, ResourceIndex};

/// Identifier prefix used when none is configured
pub const DEFAULT_PREFIX: &str = "org.n52.wps.server.r.";

/// File extensions recognised as scripts
pub const SCRIPT_EXTENSIONS: [&str; 2] = ["R", "r"];

/// One registered script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDescriptor {
    pub id: String,
    /// Absolute path of the script file
    pub path: PathBuf,
    pub annotations: Vec<Annotation>,
    /// The annotations build a valid process description
    pub valid: bool,
}

impl ScriptDescriptor {
    /// Resource handles this script declares, in declaration order
    pub fn resource_handles(&self) -> Vec<ResourceHandle> {
        self.annotations
            .iter()
            .filter(|a| a.kind == AnnotationType::Resource)
            .flat_map(|a| a.list().iter())
            .map(|name| ResourceHandle::new(self.id.clone(), name.clone()))
            .collect()
    }
}

/// Derive the public identifier for a script file, `None` if the path has no
/// usable file stem.
pub fn public_identifier(prefix: &str, path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() {
        return None;
    }
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    Some(format!("{}{}", prefix, sanitized))
}

/// True for files with a script extension
pub fn is_script_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext))
}

/// Registered scripts keyed by public identifier
pub struct ScriptRepository {
    parser: Arc<dyn MetadataParser>,
    prefix: String,
    descriptors: BTreeMap<String, ScriptDescriptor>,
    by_path: HashMap<PathBuf, String>,
}

impl ScriptRepository {
    pub fn new(parser: Arc<dyn MetadataParser>, prefix: impl Into<String>) -> Self {
        Self {
            parser,
            prefix: prefix.into(),
            descriptors: BTreeMap::new(),
            by_path: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn parser(&self) -> &Arc<dyn MetadataParser> {
        &self.parser
    }

    /// Parse and register one script file, registering its declared
    /// resources in `resources`.
    ///
    /// Returns `Ok(false)` when the file is not a script or cannot be read or
    /// parsed. A different file already registered under the same identifier
    /// is an error.
    pub fn register_script(&mut self, path: &Path, resources: &mut ResourceIndex) -> Result<bool> {
        let path = std::path::absolute(path)?;
        if !is_script_file(&path) {
            debug!("Not a script file: {}", path.display());
            return Ok(false);
        }
        let Some(id) = public_identifier(&self.prefix, &path) else {
            warn!("Cannot derive an identifier for {}", path.display());
            return Ok(false);
        };

        if let Some(existing) = self.descriptors.get(&id) {
            if existing.path != path {
                return Err(AlgorithmError::DuplicateScript {
                    id,
                    existing: existing.path.display().to_string(),
                    candidate: path.display().to_string(),
                });
            }
        }

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping script {}: {}", path.display(), e);
                return Ok(false);
            }
        };
        let annotations = match self.parser.parse(&bytes) {
            Ok(annotations) => annotations,
            Err(e) => {
                warn!("Skipping script {}: {}", path.display(), e);
                return Ok(false);
            }
        };

        let valid = match ProcessDescription::build(&id, &annotations) {
            Ok(_) => true,
            Err(messages) => {
                warn!(
                    "Script {} has an invalid description: {}",
                    id,
                    messages.join("; ")
                );
                false
            }
        };
        let descriptor = ScriptDescriptor {
            id: id.clone(),
            path: path.clone(),
            annotations,
            valid,
        };
        let handles = descriptor.resource_handles();
        if !handles.is_empty() && !resources.register_resources(&handles) {
            warn!(
                "Script {} declares resources that could not be resolved; invocations will fail until they exist",
                id
            );
        }

        debug!("Registered script {} from {}", id, path.display());
        self.by_path.insert(path, id.clone());
        self.descriptors.insert(id, descriptor);
        Ok(true)
    }

    /// Register every script directly inside `dir` (not recursive), in file
    /// name order. Scripts that fail are logged and skipped.
    pub fn scan_directory(&mut self, dir: &Path, resources: &mut ResourceIndex) -> Vec<String> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read script directory {}: {}", dir.display(), e);
                return Vec::new();
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_script_file(path))
            .collect();
        paths.sort();

        let mut registered = Vec::new();
        for path in paths {
            match self.register_script(&path, resources) {
                Ok(true) => {
                    if let Some(id) = self.identifier_for(&path) {
                        registered.push(id.to_string());
                    }
                }
                Ok(false) => {}
                Err(e) => error!("Skipping script {}: {}", path.display(), e),
            }
        }
        info!(
            "Found {} script(s) in {}",
            registered.len(),
            dir.display()
        );
        registered
    }

    /// Path of the script registered under `id`
    pub fn get_script_file(&self, id: &str) -> Result<PathBuf> {
        self.descriptors
            .get(id)
            .map(|d| d.path.clone())
            .ok_or_else(|| AlgorithmError::script_not_found(id))
    }

    pub fn descriptor(&self, id: &str) -> Option<&ScriptDescriptor> {
        self.descriptors.get(id)
    }

    /// Identifier of the script registered from `path`
    pub fn identifier_for(&self, path: &Path) -> Option<&str> {
        let path = std::path::absolute(path).ok()?;
        self.by_path.get(&path).map(String::as_str)
    }

    /// True iff the backing file still exists and is readable
    pub fn is_script_available(&self, descriptor: &ScriptDescriptor) -> bool {
        descriptor.path.is_file() && std::fs::File::open(&descriptor.path).is_ok()
    }

    /// Resolve an import of script `id`: relative names resolve against the
    /// importing script's directory; the file must be readable.
    pub fn resolve_import(&self, id: &str, name: &str) -> Result<PathBuf> {
        let script = self.get_script_file(id)?;
        let candidate = Path::new(name);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            script
                .parent()
                .map(|dir| dir.join(candidate))
                .unwrap_or_else(|| candidate.to_path_buf())
        };
        if path.is_file() && std::fs::File::open(&path).is_ok() {
            Ok(path)
        } else {
            Err(AlgorithmError::ResourceUnavailable(format!(
                "import '{}' of {} not found or unreadable: {}",
                name,
                id,
                path.display()
            )))
        }
    }

    /// Registered identifiers in sorted order
    pub fn script_ids(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Drop every descriptor
    pub fn reset(&mut self) {
        self.descriptors.clear();
        self.by_path.clear();
    }
}
