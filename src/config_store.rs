//! Persisted configuration
//!
//! The configuration is an ordered list of `(name, value, active)` entries
//! plus a repository-wide enable flag. Stores expose read-all, atomic
//! write-all and a change-notification channel; the reconciler is the only
//! writer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::error::AlgorithmError;
use crate::script_repository::SCRIPT_EXTENSIONS;
use crate::settings::{ConfigVariable, ALGORITHM_ENTRY_NAME};

fn default_true() -> bool {
    true
}

/// One persisted entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub value: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl ConfigEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>, active: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            active,
        }
    }

    /// Active algorithm entry for a script identifier
    pub fn algorithm(id: impl Into<String>) -> Self {
        Self::new(ALGORITHM_ENTRY_NAME, id, true)
    }

    /// Entry carrying a variable's default value
    pub fn default_for(var: ConfigVariable) -> Self {
        Self::new(var.to_string(), var.default_value(), true)
    }
}

/// Canonical entry order: case-insensitive (name, value), ties broken by the
/// exact strings and then the active flag so the order is total.
pub fn canonical_cmp(a: &ConfigEntry, b: &ConfigEntry) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.value.to_lowercase().cmp(&b.value.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.value.cmp(&b.value))
        .then_with(|| a.active.cmp(&b.active))
}

pub fn is_canonical_order(entries: &[ConfigEntry]) -> bool {
    entries
        .windows(2)
        .all(|pair| canonical_cmp(&pair[0], &pair[1]) != Ordering::Greater)
}

pub fn sort_canonical(entries: &mut [ConfigEntry]) {
    entries.sort_by(canonical_cmp);
}

/// True when a changed path should trigger reconciliation: the config file
/// itself, or a script directly inside one of the script directories.
/// Sibling files such as the temporary file used for atomic writes are not.
pub fn is_watched_change(config_path: &Path, script_dirs: &[PathBuf], path: &Path) -> bool {
    if path == config_path {
        return true;
    }
    let has_script_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext));
    has_script_extension && path.parent().is_some_and(|dir| script_dirs.iter().any(|d| d == dir))
}

/// Complete persisted configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository enabled; a disabled repository registers nothing
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub entries: Vec<ConfigEntry>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            active: true,
            entries: Vec::new(),
        }
    }
}

/// Change notifications delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    Changed,
    Shutdown,
}

/// Errors raised by configuration stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl From<StoreError> for AlgorithmError {
    fn from(err: StoreError) -> Self {
        AlgorithmError::ReconciliationIo(err.to_string())
    }
}

/// Read-all / write-all access to the persisted configuration
pub trait ConfigStore: Send + Sync {
    fn read_all(&self) -> Result<RepositoryConfig, StoreError>;

    /// Replace the whole configuration; on error the previous content stays
    fn write_all(&self, config: &RepositoryConfig) -> Result<(), StoreError>;

    /// New receiver for change notifications
    fn subscribe(&self) -> Receiver<ConfigEvent>;

    /// Directory relative configuration paths resolve against
    fn base_dir(&self) -> Option<PathBuf> {
        None
    }
}

/// Fan-out of [`ConfigEvent`]s to any number of subscribers
#[derive(Debug, Default)]
pub struct ConfigEvents {
    subscribers: Mutex<Vec<Sender<ConfigEvent>>>,
}

impl ConfigEvents {
    pub fn subscribe(&self) -> Receiver<ConfigEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event`, forgetting disconnected subscribers. Returns how many
    /// subscribers received it.
    pub fn publish(&self, event: ConfigEvent) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event).is_ok());
        subscribers.len()
    }
}

/// Configuration persisted as one JSON file
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    events: ConfigEvents,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            events: ConfigEvents::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tell subscribers the file changed outside the runtime
    pub fn notify_changed(&self) -> usize {
        self.events.publish(ConfigEvent::Changed)
    }

    pub fn notify_shutdown(&self) -> usize {
        self.events.publish(ConfigEvent::Shutdown)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl ConfigStore for JsonConfigStore {
    fn read_all(&self) -> Result<RepositoryConfig, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist yet, starting empty", self.path.display());
                return Ok(RepositoryConfig::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&content).map_err(|source| StoreError::Format {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write_all(&self, config: &RepositoryConfig) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;
        serde_json::to_writer_pretty(&mut tmp, config).map_err(|source| StoreError::Format {
            path: self.path.display().to_string(),
            source,
        })?;
        tmp.write_all(b"\n").map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        debug!("Wrote {} entries to {}", config.entries.len(), self.path.display());
        Ok(())
    }

    fn subscribe(&self) -> Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    fn base_dir(&self) -> Option<PathBuf> {
        let parent = self.path.parent()?;
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        std::path::absolute(parent).ok()
    }
}

/// In-memory store for tests and embedding; counts writes and can be told
/// to reject them.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<RepositoryConfig>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    events: ConfigEvents,
}

impl MemoryConfigStore {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            config: Mutex::new(config),
            ..Self::default()
        }
    }

    pub fn with_entries(entries: Vec<ConfigEntry>) -> Self {
        Self::new(RepositoryConfig {
            active: true,
            entries,
        })
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Current content
    pub fn snapshot(&self) -> RepositoryConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the content the way an external editor would; no
    /// notification is sent and no write is counted.
    pub fn replace(&self, config: RepositoryConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn notify_changed(&self) -> usize {
        self.events.publish(ConfigEvent::Changed)
    }

    pub fn notify_shutdown(&self) -> usize {
        self.events.publish(ConfigEvent::Shutdown)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read_all(&self) -> Result<RepositoryConfig, StoreError> {
        Ok(self.snapshot())
    }

    fn write_all(&self, config: &RepositoryConfig) -> Result<(), StoreError> {
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::WriteRejected("store is read-only".to_string()));
        }
        self.replace(config.clone());
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> Receiver<ConfigEvent> {
        self.events.subscribe()
    }
}
