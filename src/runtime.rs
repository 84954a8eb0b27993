//! Process-scoped runtime context
//!
//! [`RuntimeContext`] ties the configuration store, reconciler, session pool
//! and algorithm registry together and is the one object the outer protocol
//! layer talks to. Build it with [`RuntimeBuilder`], call
//! [`init`](RuntimeContext::init) once, and [`shutdown`](RuntimeContext::shutdown)
//! when done.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::annotation::{AnnotationParser, MetadataParser};
use crate::config_store::{ConfigEvent, ConfigStore};
use crate::description::ProcessDescription;
use crate::engine::pool::SessionPool;
use crate::engine::rscript::RscriptConnector;
use crate::engine::EngineConnector;
use crate::error::{AlgorithmError, FailureReport, Result};
use crate::reconciler::{settings_from_entries, ReconcileReport, Reconciler};
use crate::registry::{AlgorithmRegistry, RegistryState};
use crate::script_repository::DEFAULT_PREFIX;
use crate::settings::RuntimeSettings;
use crate::types::{Inputs, Outputs};

/// Builder for [`RuntimeContext`]
pub struct RuntimeBuilder {
    store: Option<Arc<dyn ConfigStore>>,
    connector: Option<Arc<dyn EngineConnector>>,
    parser: Option<Arc<dyn MetadataParser>>,
    base_dir: Option<PathBuf>,
    prefix: String,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            connector: None,
            parser: None,
            base_dir: None,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Engine to run scripts on. Defaults to [`RscriptConnector`] using the
    /// configured engine command.
    pub fn connector(mut self, connector: Arc<dyn EngineConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn MetadataParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Directory relative configured paths resolve against. Defaults to the
    /// store's directory, then the process working directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<RuntimeContext> {
        let store = self.store.ok_or_else(|| {
            AlgorithmError::invalid_input("store", "a configuration store is required")
        })?;
        let base_dir = match self.base_dir.or_else(|| store.base_dir()) {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let parser = self.parser.unwrap_or_else(|| Arc::new(AnnotationParser));

        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                let settings = settings_from_entries(&store.read_all()?.entries, &base_dir);
                debug!("Using engine command '{}'", settings.engine_command);
                Arc::new(
                    RscriptConnector::new(settings.engine_command.clone(), None)
                        .with_timeout(settings.engine_timeout()),
                )
            }
        };

        let events = store.subscribe();
        let reconciler = Reconciler::new(store, parser, self.prefix, base_dir);
        let limits = reconciler.read().settings.pool_limits();
        let pool = Arc::new(SessionPool::new(connector, limits));
        let registry = AlgorithmRegistry::new(reconciler.catalog(), Arc::clone(&pool));

        Ok(RuntimeContext {
            reconciler,
            registry,
            pool,
            events: Mutex::new(events),
        })
    }
}

/// The registry and execution runtime, shared by every caller
pub struct RuntimeContext {
    reconciler: Reconciler,
    registry: AlgorithmRegistry,
    pool: Arc<SessionPool>,
    events: Mutex<Receiver<ConfigEvent>>,
}

impl RuntimeContext {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Start the registry: check the engine, reconcile, load active
    /// algorithms.
    pub fn init(&self) -> Result<RegistryState> {
        let state = self.registry.start_up(|| {
            let report = self.reconciler.reconcile()?;
            self.apply_pool_limits();
            Ok(report)
        })?;
        info!(
            "Runtime initialised ({}): {} algorithm(s)",
            state,
            self.registry.len()
        );
        Ok(state)
    }

    /// Reconcile the configuration and bring the registry and pool in line
    /// with it.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.reconciler.reconcile()?;
        self.apply_pool_limits();
        self.registry.sync(&report);
        Ok(report)
    }

    fn apply_pool_limits(&self) {
        let limits = self.reconciler.read().settings.pool_limits();
        if limits != self.pool.limits() {
            debug!(
                "Session pool limits: {} idle, {} active",
                limits.max_idle, limits.max_active
            );
            self.pool.set_limits(limits);
        }
    }

    /// Handle every queued configuration event without blocking.
    ///
    /// A batch of `Changed` events triggers one reconciliation. Returns the
    /// number of events consumed. A `Shutdown` event shuts the runtime down.
    pub fn handle_pending_events(&self) -> Result<usize> {
        let (changed, shutdown, handled) = {
            let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            drain(&events)
        };
        if shutdown {
            self.shutdown();
        } else if changed {
            self.reconcile()?;
        }
        Ok(handled)
    }

    /// Block on configuration events, reconciling on every batch of changes,
    /// until `Shutdown` arrives or every publisher is gone. Reconciliation
    /// errors are logged and the loop carries on.
    pub fn run_event_loop(&self) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match events.recv() {
                Ok(ConfigEvent::Changed) => {
                    let (_, shutdown, _) = drain(&events);
                    if shutdown {
                        break;
                    }
                    if let Err(e) = self.reconcile() {
                        error!("Reconciliation after configuration change failed: {}", e);
                    }
                }
                Ok(ConfigEvent::Shutdown) => break,
                Err(_) => {
                    debug!("Configuration event channel closed");
                    break;
                }
            }
        }
        drop(events);
        self.shutdown();
    }

    /// Run algorithm `id` with `inputs`
    pub fn invoke(&self, id: &str, inputs: &Inputs) -> Result<Outputs> {
        let algorithm = self.registry.get_algorithm(id)?;
        algorithm.run(&self.pool, &self.reconciler.catalog(), inputs)
    }

    /// Like [`invoke`](Self::invoke) with the failure collapsed into a
    /// [`FailureReport`]
    pub fn invoke_report(
        &self,
        id: &str,
        inputs: &Inputs,
    ) -> std::result::Result<Outputs, FailureReport> {
        self.invoke(id, inputs).map_err(|e| e.report())
    }

    pub fn describe(&self, id: &str) -> Result<ProcessDescription> {
        Ok(self.registry.get_algorithm(id)?.description().clone())
    }

    pub fn algorithm_names(&self) -> Vec<String> {
        self.registry.algorithm_names()
    }

    pub fn state(&self) -> RegistryState {
        self.registry.state()
    }

    pub fn registry(&self) -> &AlgorithmRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Current effective settings
    pub fn settings(&self) -> RuntimeSettings {
        self.reconciler.read().settings.clone()
    }

    /// Clear the registry and close pooled sessions. Terminal.
    pub fn shutdown(&self) {
        if self.registry.state() == RegistryState::Shutdown {
            return;
        }
        self.registry.shutdown();
        info!("Runtime shut down");
    }
}

/// Consume queued events: (any change, shutdown seen, count)
fn drain(events: &Receiver<ConfigEvent>) -> (bool, bool, usize) {
    let mut changed = false;
    let mut handled = 0;
    loop {
        match events.try_recv() {
            Ok(ConfigEvent::Changed) => {
                changed = true;
                handled += 1;
            }
            Ok(ConfigEvent::Shutdown) => return (changed, true, handled + 1),
            Err(TryRecvError::Empty) => return (changed, false, handled),
            Err(TryRecvError::Disconnected) => {
                warn!("Configuration event channel disconnected");
                return (changed, false, handled);
            }
        }
    }
}
