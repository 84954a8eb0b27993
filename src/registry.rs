//! Algorithm registry
//!
//! Process-level table of loaded [`Algorithm`]s keyed by public identifier.
//! Start-up is gated on the engine: when a test connection cannot be opened
//! the registry goes [`Inactive`](RegistryState::Inactive) and stays empty
//! instead of failing. In uncached mode every lookup reloads the script from
//! disk.
//!
//! # State Flow
//!
//! ```text
//! Uninitialized ──start_up──→ Ready
//!       │                       │
//!       └──────→ Inactive ←─────┘ (engine unreachable / repository disabled)
//!
//! any ──shutdown──→ Shutdown (terminal)
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use strum::Display;
use tracing::{debug, info, warn};

use crate::algorithm::Algorithm;
use crate::engine::pool::SessionPool;
use crate::error::{AlgorithmError, Result};
use crate::reconciler::{Catalog, ReconcileReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RegistryState {
    Uninitialized,
    Ready,
    Inactive,
    Shutdown,
}

struct RegistryInner {
    state: RegistryState,
    algorithms: BTreeMap<String, Arc<Algorithm>>,
}

/// Loaded algorithms, shared by every invocation
pub struct AlgorithmRegistry {
    catalog: Arc<RwLock<Catalog>>,
    pool: Arc<SessionPool>,
    inner: RwLock<RegistryInner>,
}

impl AlgorithmRegistry {
    pub fn new(catalog: Arc<RwLock<Catalog>>, pool: Arc<SessionPool>) -> Self {
        Self {
            catalog,
            pool,
            inner: RwLock::new(RegistryInner {
                state: RegistryState::Uninitialized,
                algorithms: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self, id: &str) -> Result<Algorithm> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        Algorithm::load(id, &catalog)
    }

    fn is_valid(&self, id: &str) -> bool {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .repository
            .descriptor(id)
            .is_some_and(|d| d.valid)
    }

    fn cached(&self) -> bool {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .settings
            .cache_processes
    }

    pub fn state(&self) -> RegistryState {
        self.read().state
    }

    fn set_state(&self, state: RegistryState) {
        let mut inner = self.write();
        if inner.state != state {
            info!("Algorithm registry {} -> {}", inner.state, state);
            inner.state = state;
        }
        if state != RegistryState::Ready {
            inner.algorithms.clear();
        }
    }

    /// Bring the registry up.
    ///
    /// The engine is checked first; when it is unreachable the registry goes
    /// inactive and `reconcile` is not called. Otherwise `reconcile` runs and
    /// every active algorithm it reports is loaded. Algorithms that fail to
    /// load are logged and skipped. Only a reconciliation failure is returned.
    pub fn start_up<F>(&self, reconcile: F) -> Result<RegistryState>
    where
        F: FnOnce() -> Result<ReconcileReport>,
    {
        match self.state() {
            RegistryState::Shutdown => {
                warn!("Algorithm registry is shut down, ignoring start-up");
                return Ok(RegistryState::Shutdown);
            }
            RegistryState::Ready => {
                debug!("Algorithm registry already started");
                return Ok(RegistryState::Ready);
            }
            _ => {}
        }

        if let Err(e) = self.pool.check_reachable() {
            warn!(
                "Execution engine '{}' unreachable, registering no algorithms: {}",
                self.pool.connector().name(),
                e
            );
            self.set_state(RegistryState::Inactive);
            return Ok(RegistryState::Inactive);
        }

        let report = reconcile()?;
        if !report.repository_active {
            info!("Script repository disabled, registering no algorithms");
            self.set_state(RegistryState::Inactive);
            return Ok(RegistryState::Inactive);
        }

        self.set_state(RegistryState::Ready);
        let mut loaded = 0;
        for id in &report.active_algorithms {
            if !self.is_valid(id) {
                warn!("Skipping algorithm {}: invalid process description", id);
                continue;
            }
            match self.add_algorithm(id) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(e) => warn!("Skipping algorithm {}: {}", id, e),
            }
        }
        info!(
            "Algorithm registry ready with {} of {} active algorithm(s)",
            loaded,
            report.active_algorithms.len()
        );
        Ok(RegistryState::Ready)
    }

    /// Load and validate `id`, replacing any previous instance.
    ///
    /// On failure the previous instance stays. Returns `Ok(false)` when the
    /// registry is not ready.
    pub fn add_algorithm(&self, id: &str) -> Result<bool> {
        if self.state() != RegistryState::Ready {
            debug!("Not adding {}: registry is {}", id, self.state());
            return Ok(false);
        }
        let algorithm = self.load(id)?;
        let mut inner = self.write();
        // Shutdown may have raced the load
        if inner.state != RegistryState::Ready {
            return Ok(false);
        }
        if inner
            .algorithms
            .insert(id.to_string(), Arc::new(algorithm))
            .is_some()
        {
            debug!("Reloaded algorithm {}", id);
        } else {
            debug!("Added algorithm {}", id);
        }
        Ok(true)
    }

    /// Look an algorithm up. Uncached mode reloads it from disk first.
    pub fn get_algorithm(&self, id: &str) -> Result<Arc<Algorithm>> {
        let existing = {
            let inner = self.read();
            if inner.state != RegistryState::Ready {
                return Err(AlgorithmError::algorithm_not_found(id));
            }
            inner
                .algorithms
                .get(id)
                .cloned()
                .ok_or_else(|| AlgorithmError::algorithm_not_found(id))?
        };
        if self.cached() {
            return Ok(existing);
        }

        let fresh = Arc::new(self.load(id)?);
        let mut inner = self.write();
        if inner.state == RegistryState::Ready && inner.algorithms.contains_key(id) {
            inner.algorithms.insert(id.to_string(), Arc::clone(&fresh));
        }
        Ok(fresh)
    }

    /// Unregister `id`. Returns false only for a blank identifier; removing
    /// an absent algorithm succeeds.
    pub fn remove_algorithm(&self, id: &str) -> bool {
        if id.trim().is_empty() {
            return false;
        }
        if self.write().algorithms.remove(id).is_some() {
            debug!("Removed algorithm {}", id);
        }
        true
    }

    /// Align the table with a reconciliation result: drop algorithms that
    /// are no longer active and (re)load every active one, keeping the
    /// previous instance when a reload fails.
    pub fn sync(&self, report: &ReconcileReport) {
        if self.state() != RegistryState::Ready {
            debug!("Registry is {}, not syncing", self.state());
            return;
        }

        let stale: Vec<String> = self
            .read()
            .algorithms
            .keys()
            .filter(|id| !report.active_algorithms.contains(id))
            .cloned()
            .collect();
        for id in &stale {
            self.remove_algorithm(id);
            info!("Unregistered algorithm {}", id);
        }

        for id in &report.active_algorithms {
            let had_previous = self.contains(id);
            if let Err(e) = self.add_algorithm(id) {
                if had_previous {
                    warn!("Reload of {} failed, keeping previous version: {}", id, e);
                } else {
                    warn!("Skipping algorithm {}: {}", id, e);
                }
            }
        }
    }

    /// Clear every entry; the registry stays shut down.
    pub fn shutdown(&self) {
        self.set_state(RegistryState::Shutdown);
        let drained = self.pool.drain();
        debug!("Closed {} pooled session(s) on shutdown", drained);
    }

    pub fn algorithm_names(&self) -> Vec<String> {
        self.read().algorithms.keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().algorithms.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().algorithms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().algorithms.is_empty()
    }
}
