//! Configuration reconciliation
//!
//! Brings the persisted entry list into agreement with the scripts found on
//! disk and the set of recognised variables. A run rescans every script
//! directory into a fresh [`Catalog`], adds entries for new scripts, drops
//! entries whose script vanished, adds missing variable defaults and writes
//! the list back only when something changed. The shared catalog is swapped
//! only after the whole run succeeded, so a failed run leaves the previous
//! state in place.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::annotation::MetadataParser;
use crate::config_store::{
    is_canonical_order, sort_canonical, ConfigEntry, ConfigStore, RepositoryConfig,
};
use crate::error::Result;
use crate::resource_index::ResourceIndex;
use crate::script_repository::ScriptRepository;
use crate::settings::{is_algorithm_entry, ConfigVariable, RuntimeSettings};

/// Everything a reconciliation run produces, swapped in as one unit
pub struct Catalog {
    pub repository: ScriptRepository,
    pub resources: ResourceIndex,
    pub settings: RuntimeSettings,
    pub config: RepositoryConfig,
}

impl Catalog {
    /// Empty catalog with default settings
    pub fn empty(parser: Arc<dyn MetadataParser>, prefix: &str, base_dir: &Path) -> Self {
        Self {
            repository: ScriptRepository::new(parser, prefix),
            resources: ResourceIndex::new(),
            settings: RuntimeSettings::defaults(base_dir),
            config: RepositoryConfig::default(),
        }
    }

    /// Identifiers of active algorithm entries whose script is registered, sorted
    pub fn active_algorithms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .config
            .entries
            .iter()
            .filter(|e| e.active && is_algorithm_entry(&e.name))
            .filter(|e| self.repository.descriptor(&e.value).is_some())
            .map(|e| e.value.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Algorithm entries created for newly found scripts
    pub added: Vec<String>,
    /// Algorithm entries dropped because their script is gone
    pub removed: Vec<String>,
    /// Variables that received a default entry
    pub defaults_added: Vec<String>,
    /// Duplicate entries dropped
    pub duplicates_dropped: usize,
    /// Persisted order differed from canonical order
    pub reordered: bool,
    /// The store was written
    pub written: bool,
    pub repository_active: bool,
    pub active_algorithms: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.defaults_added.is_empty()
            || self.duplicates_dropped > 0
            || self.reordered
    }
}

/// Single-writer sync between the configuration store and the script tree
pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    parser: Arc<dyn MetadataParser>,
    prefix: String,
    base_dir: PathBuf,
    catalog: Arc<RwLock<Catalog>>,
    writer: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        parser: Arc<dyn MetadataParser>,
        prefix: impl Into<String>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        let prefix = prefix.into();
        let base_dir = base_dir.into();
        let catalog = Catalog::empty(parser.clone(), &prefix, &base_dir);
        Self {
            store,
            parser,
            prefix,
            base_dir,
            catalog: Arc::new(RwLock::new(catalog)),
            writer: Mutex::new(()),
        }
    }

    /// Shared handle on the current catalog
    pub fn catalog(&self) -> Arc<RwLock<Catalog>> {
        Arc::clone(&self.catalog)
    }

    /// Read access to the current catalog
    pub fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Run one reconciliation. Concurrent callers are serialized.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let persisted = self.store.read_all().inspect_err(|e| {
            warn!("Reconciliation skipped, configuration unreadable: {}", e);
        })?;
        let mut report = ReconcileReport {
            repository_active: persisted.active,
            ..ReconcileReport::default()
        };

        // Partition into variable/other entries and algorithm entries
        let mut others: Vec<ConfigEntry> = Vec::new();
        let mut seen_vars: HashSet<ConfigVariable> = HashSet::new();
        let mut algorithms: Vec<ConfigEntry> = Vec::new();
        let mut pending: HashMap<String, usize> = HashMap::new();
        for entry in &persisted.entries {
            if is_algorithm_entry(&entry.name) {
                if pending.contains_key(&entry.value) {
                    debug!("Dropping duplicate algorithm entry {}", entry.value);
                    report.duplicates_dropped += 1;
                    continue;
                }
                pending.insert(entry.value.clone(), algorithms.len());
                algorithms.push(entry.clone());
            } else {
                if let Some(var) = ConfigVariable::from_name(&entry.name) {
                    if !seen_vars.insert(var) {
                        debug!("Dropping duplicate entry for {}", var);
                        report.duplicates_dropped += 1;
                        continue;
                    }
                } else {
                    debug!("Keeping unrecognised entry {}", entry.name);
                }
                others.push(entry.clone());
            }
        }

        for var in ConfigVariable::all() {
            if !seen_vars.contains(&var) {
                others.push(ConfigEntry::default_for(var));
                report.defaults_added.push(var.to_string());
            }
        }

        let settings = self.settings_for(&others);
        let (repository, resources) = self.scan(&settings);

        // Match registered scripts against existing algorithm entries
        let mut kept = vec![false; algorithms.len()];
        let mut added = Vec::new();
        for id in repository.script_ids() {
            match pending.remove(&id) {
                Some(index) => kept[index] = true,
                None => {
                    added.push(ConfigEntry::algorithm(id.clone()));
                    report.added.push(id);
                }
            }
        }

        let mut entries = others;
        for (entry, keep) in algorithms.into_iter().zip(kept) {
            if keep {
                entries.push(entry);
            } else {
                report.removed.push(entry.value);
            }
        }
        entries.extend(added);
        report.removed.sort();

        // Order is judged on the list as persisted, not on the rebuilt one
        report.reordered = !is_canonical_order(&persisted.entries);
        sort_canonical(&mut entries);

        let config = if report.changed() {
            let candidate = RepositoryConfig {
                active: persisted.active,
                entries,
            };
            self.store.write_all(&candidate).inspect_err(|e| {
                warn!("Reconciled configuration could not be persisted: {}", e);
            })?;
            report.written = true;
            // Read back what was written
            self.store.read_all()?
        } else {
            RepositoryConfig {
                active: persisted.active,
                entries,
            }
        };

        let catalog = Catalog {
            settings: self.settings_for(&config.entries),
            repository,
            resources,
            config,
        };
        report.active_algorithms = if report.repository_active {
            catalog.active_algorithms()
        } else {
            Vec::new()
        };
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = catalog;

        if report.changed() {
            info!(
                "Reconciled configuration: {} added, {} removed, {} default(s), {} duplicate(s){}",
                report.added.len(),
                report.removed.len(),
                report.defaults_added.len(),
                report.duplicates_dropped,
                if report.reordered { ", reordered" } else { "" }
            );
        } else {
            info!(
                "Configuration up to date, no changes ({} active algorithm(s))",
                report.active_algorithms.len()
            );
        }
        Ok(report)
    }

    /// Settings after applying every active variable entry over the defaults
    pub fn settings_for(&self, entries: &[ConfigEntry]) -> RuntimeSettings {
        settings_from_entries(entries, &self.base_dir)
    }

    /// Fresh repository and resource index built from the configured directories
    fn scan(&self, settings: &RuntimeSettings) -> (ScriptRepository, ResourceIndex) {
        let mut repository = ScriptRepository::new(Arc::clone(&self.parser), self.prefix.as_str());
        let mut resources = ResourceIndex::new();
        for dir in &settings.resource_dirs {
            resources.add_search_directory(dir);
        }
        for dir in &settings.script_dirs {
            if !dir.is_dir() {
                warn!("Script directory {} does not exist", dir.display());
                continue;
            }
            repository.scan_directory(dir, &mut resources);
        }
        (repository, resources)
    }
}

/// Apply active variable entries over the defaults. Invalid values are
/// logged and the default stays in effect.
pub fn settings_from_entries(entries: &[ConfigEntry], base_dir: &Path) -> RuntimeSettings {
    let mut settings = RuntimeSettings::defaults(base_dir);
    let mut applied = HashSet::new();
    for entry in entries.iter().filter(|e| e.active) {
        let Some(var) = ConfigVariable::from_name(&entry.name) else {
            continue;
        };
        if !applied.insert(var) {
            continue;
        }
        if let Err(reason) = settings.apply(var, &entry.value) {
            warn!(
                "Ignoring {} = '{}': {}; using default '{}'",
                var,
                entry.value,
                reason,
                var.default_value()
            );
        }
    }
    settings
}
