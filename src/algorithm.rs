//! Algorithm instances and the invocation run loop
//!
//! An [`Algorithm`] is one script's validated description plus what it needs
//! at run time. [`Algorithm::run`] leases a session and walks it through the
//! lifecycle tracked by [`StageTracker`](crate::session_state::StageTracker):
//!
//! ```text
//! Connect → ConfigureSession → LoadResources → LoadInputs → LoadImports
//!         → Execute → CollectOutputs → Cleanup → Close
//! ```
//!
//! Cleanup runs on every exit path. The session's working directory is put
//! back, the per-invocation workspace directory is removed and the lease is
//! returned to the pool, or discarded when the connection is gone.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, info_span, warn};

use crate::description::ProcessDescription;
use crate::engine::pool::{SessionLease, SessionPool};
use crate::engine::{EngineError, EngineSession};
use crate::error::{AlgorithmError, ErrorKind, Result};
use crate::reconciler::Catalog;
use crate::resource_index::ResourceHandle;
use crate::session_state::{SessionState, Stage};
use crate::settings::RuntimeSettings;
use crate::types::{DataType, Inputs, Outputs, Value};

/// Session option naming the running algorithm
pub const OPTION_ALGORITHM: &str = "wps.algorithm";

/// Session option naming the invocation workspace directory
pub const OPTION_WORKSPACE: &str = "wps.workspace";

/// One validated input ready to be bound
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub data_type: DataType,
    pub value: Value,
}

/// A loaded, validated algorithm
#[derive(Debug, Clone)]
pub struct Algorithm {
    description: ProcessDescription,
    script_path: PathBuf,
    resources: Vec<ResourceHandle>,
}

impl Algorithm {
    /// Load `id` from disk and validate its description.
    ///
    /// The script file is re-read and re-parsed on every call, so a reload
    /// always sees the current file content.
    pub fn load(id: &str, catalog: &Catalog) -> Result<Self> {
        let descriptor = catalog
            .repository
            .descriptor(id)
            .ok_or_else(|| AlgorithmError::algorithm_not_found(id))?;
        if !catalog.repository.is_script_available(descriptor) {
            return Err(AlgorithmError::script_not_found(id));
        }

        let bytes = fs::read(&descriptor.path)?;
        let annotations = catalog
            .repository
            .parser()
            .parse(&bytes)
            .map_err(|e| AlgorithmError::unparseable(id, &e))?;
        let description = ProcessDescription::build(id, &annotations).map_err(|messages| {
            AlgorithmError::InvalidDescription {
                id: id.to_string(),
                messages,
            }
        })?;
        let resources = description
            .resources
            .iter()
            .map(|name| ResourceHandle::new(id, name.clone()))
            .collect();

        debug!("Loaded algorithm {} from {}", id, descriptor.path.display());
        Ok(Self {
            description,
            script_path: descriptor.path.clone(),
            resources,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.description.identifier
    }

    pub fn description(&self) -> &ProcessDescription {
        &self.description
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn resources(&self) -> &[ResourceHandle] {
        &self.resources
    }

    /// Check supplied inputs against the declared ones: undeclared names,
    /// missing required inputs, occurrence bounds and type coercion.
    /// Declared defaults fill omitted inputs.
    pub fn bind_inputs(&self, supplied: &Inputs) -> Result<Vec<Binding>> {
        if let Some(name) = supplied
            .keys()
            .find(|name| self.description.input(name).is_none())
        {
            return Err(AlgorithmError::invalid_input(
                name.as_str(),
                format!("not declared by {}", self.identifier()),
            ));
        }

        let mut bindings = Vec::with_capacity(self.description.inputs.len());
        for input in &self.description.inputs {
            let value = match supplied
                .get(&input.identifier)
                .filter(|v| v.occurrences() > 0)
            {
                Some(value) => value.clone(),
                None => match &input.default {
                    Some(default) => default.clone(),
                    None if input.min_occurs == 0 => continue,
                    None => {
                        return Err(AlgorithmError::invalid_input(
                            input.identifier.as_str(),
                            "required input is missing",
                        ));
                    }
                },
            };

            let count = value.occurrences();
            if count < input.min_occurs as usize || count > input.max_occurs as usize {
                return Err(AlgorithmError::invalid_input(
                    input.identifier.as_str(),
                    format!(
                        "expected between {} and {} value(s), got {}",
                        input.min_occurs, input.max_occurs, count
                    ),
                ));
            }
            let coerced = value.coerce(input.data_type).ok_or_else(|| {
                AlgorithmError::invalid_input(
                    input.identifier.as_str(),
                    format!("'{}' is not a valid {}", value, input.data_type),
                )
            })?;
            bindings.push(Binding {
                name: input.identifier.clone(),
                data_type: input.data_type,
                value: coerced,
            });
        }
        Ok(bindings)
    }

    /// Run one invocation to completion.
    ///
    /// Outputs are returned all-or-nothing. Whatever happens, the session is
    /// cleaned up and released before this returns.
    pub fn run(
        &self,
        pool: &SessionPool,
        catalog: &RwLock<Catalog>,
        inputs: &Inputs,
    ) -> Result<Outputs> {
        let id = self.identifier();
        let bindings = self.bind_inputs(inputs)?;
        let settings = catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .settings
            .clone();

        fs::create_dir_all(&settings.work_dir)?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("{}-", self.invocation_prefix()))
            .tempdir_in(&settings.work_dir)?;
        let invocation = workspace
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());

        let _span = info_span!("invoke", algorithm = %id, invocation = %invocation).entered();
        let mut state = SessionState::new(workspace.path().to_path_buf());
        info!("Invoking {} as {}", id, invocation);

        enter(&mut state, Stage::Connect);
        let outcome = match pool.acquire() {
            Ok(mut lease) => {
                let outcome = self.drive(
                    &mut *lease,
                    &mut state,
                    &bindings,
                    &settings,
                    catalog,
                    &invocation,
                );
                if outcome.is_err() {
                    let _ = state.tracker.fail();
                }
                cleanup(&mut lease, &mut state, outcome.as_ref().err());
                outcome
            }
            Err(e) => {
                let _ = state.tracker.fail();
                if let Err(e) = state.tracker.begin_cleanup() {
                    debug!("Stage tracking: {}", e);
                }
                Err(AlgorithmError::engine(Stage::Connect, e))
            }
        };
        enter(&mut state, Stage::Close);

        if let Err(e) = workspace.close() {
            warn!("Could not remove workspace of {}: {}", invocation, e);
        }

        state.success = outcome.is_ok();
        match &outcome {
            Ok(outputs) => info!(
                "{} finished with {} output(s)",
                invocation,
                outputs.len()
            ),
            Err(e) => warn!(
                "{} failed at stage {}: {}",
                invocation,
                state.tracker.reached(),
                e
            ),
        }
        outcome
    }

    fn drive(
        &self,
        session: &mut dyn EngineSession,
        state: &mut SessionState,
        bindings: &[Binding],
        settings: &RuntimeSettings,
        catalog: &RwLock<Catalog>,
        invocation: &str,
    ) -> Result<Outputs> {
        let id = self.identifier();

        enter(state, Stage::ConfigureSession);
        state.original_dir = Some(session.working_dir().map_err(at(Stage::ConfigureSession))?);
        session
            .set_option(OPTION_ALGORITHM, &Value::from(id))
            .map_err(at(Stage::ConfigureSession))?;
        session
            .set_option(
                OPTION_WORKSPACE,
                &Value::Text(state.workspace_root.display().to_string()),
            )
            .map_err(at(Stage::ConfigureSession))?;
        session
            .change_dir(&state.workspace_root)
            .map_err(at(Stage::ConfigureSession))?;

        enter(state, Stage::LoadResources);
        let resolved: Vec<(String, PathBuf)> = {
            let catalog = catalog.read().unwrap_or_else(PoisonError::into_inner);
            self.resources
                .iter()
                .map(|handle| {
                    match catalog.resources.resolve(handle) {
                        Ok(path) => Ok((handle.name.clone(), path)),
                        Err(AlgorithmError::NotFound { .. }) => {
                            Err(AlgorithmError::ResourceUnavailable(format!(
                                "resource {} was not found on the search path",
                                handle
                            )))
                        }
                        Err(e) => Err(e),
                    }
                })
                .collect::<Result<_>>()?
        };
        for (name, source) in resolved {
            copy_into(&source, &workspace_target(&state.workspace_root, &name))?;
            debug!("Loaded resource {} from {}", name, source.display());
            state.loaded_resources.push(name);
        }

        enter(state, Stage::LoadInputs);
        for binding in bindings {
            let value = if binding.data_type == DataType::File {
                stage_file_input(&binding.name, &binding.value, &state.workspace_root)?
            } else {
                binding.value.clone()
            };
            session
                .assign(&binding.name, &value)
                .map_err(at(Stage::LoadInputs))?;
            state.loaded_inputs.push(binding.name.clone());
        }

        enter(state, Stage::LoadImports);
        let imports: Vec<(String, PathBuf)> = {
            let catalog = catalog.read().unwrap_or_else(PoisonError::into_inner);
            self.description
                .imports
                .iter()
                .map(|name| {
                    catalog
                        .repository
                        .resolve_import(id, name)
                        .map(|path| (name.clone(), path))
                })
                .collect::<Result<_>>()?
        };
        for (name, path) in imports {
            session.load_file(&path).map_err(at(Stage::LoadImports))?;
            state.loaded_imports.push(name);
        }

        enter(state, Stage::Execute);
        let results_dir = settings.results_dir().join(invocation);
        if settings.save_images {
            save_image(session, &results_dir, "before");
        }
        let succeeded = session
            .execute(&self.script_path)
            .map_err(at(Stage::Execute))?;
        if settings.save_images {
            save_image(session, &results_dir, "after");
        }
        if !succeeded {
            return Err(AlgorithmError::script_failed(id, "script reported failure"));
        }

        enter(state, Stage::CollectOutputs);
        let collected = self.collect_outputs(session, &state.workspace_root, &results_dir);
        if collected.is_err() && !settings.save_images && results_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&results_dir) {
                warn!("Could not remove {}: {}", results_dir.display(), e);
            }
        }
        collected
    }

    fn collect_outputs(
        &self,
        session: &mut dyn EngineSession,
        workspace: &Path,
        results_dir: &Path,
    ) -> Result<Outputs> {
        let id = self.identifier();
        let mut outputs = Outputs::new();
        for output in &self.description.outputs {
            let raw = session
                .read_value(&output.identifier)
                .map_err(at(Stage::CollectOutputs))?
                .filter(|value| !matches!(value, Value::Null))
                .ok_or_else(|| {
                    AlgorithmError::script_failed(
                        id,
                        format!("output '{}' was not produced", output.identifier),
                    )
                })?;
            let value = raw.coerce(output.data_type).ok_or_else(|| {
                AlgorithmError::script_failed(
                    id,
                    format!(
                        "output '{}' is not a valid {}: {}",
                        output.identifier, output.data_type, raw
                    ),
                )
            })?;
            let value = if output.data_type == DataType::File {
                export_file(id, &output.identifier, &value, workspace, results_dir)?
            } else {
                value
            };
            outputs.insert(output.identifier.clone(), value);
        }
        Ok(outputs)
    }

    /// File-name-safe prefix for workspace directories
    fn invocation_prefix(&self) -> String {
        self.script_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "invocation".to_string())
    }
}

fn at(stage: Stage) -> impl FnOnce(EngineError) -> AlgorithmError {
    move |source| AlgorithmError::engine(stage, source)
}

fn enter(state: &mut SessionState, stage: Stage) {
    if let Err(e) = state.tracker.transition_to(stage) {
        debug!("Stage tracking: {}", e);
    }
}

/// Restore the session and decide whether it may be pooled again.
/// Failures here are logged, never raised.
fn cleanup(lease: &mut SessionLease<'_>, state: &mut SessionState, error: Option<&AlgorithmError>) {
    if let Err(e) = state.tracker.begin_cleanup() {
        debug!("Stage tracking: {}", e);
    }

    let connection_lost =
        error.is_some_and(|e| e.kind() == ErrorKind::EngineUnreachable) || !lease.is_alive();
    if connection_lost {
        warn!("Engine session lost, discarding it");
        lease.discard();
        return;
    }

    if let Some(original) = &state.original_dir {
        if let Err(e) = lease.change_dir(original) {
            warn!(
                "Could not restore working directory {}: {}",
                original.display(),
                e
            );
            lease.discard();
        }
    }
}

fn save_image(session: &mut dyn EngineSession, results_dir: &Path, label: &str) {
    let path = results_dir.join(format!("workspace-{}.RData", label));
    let saved = fs::create_dir_all(results_dir)
        .map_err(EngineError::from)
        .and_then(|()| session.save_image(&path));
    match saved {
        Ok(()) => debug!("Saved workspace image {}", path.display()),
        Err(e) => warn!("Could not save workspace image {}: {}", path.display(), e),
    }
}

/// Where a named resource lands inside the workspace. Absolute names keep
/// only their file name; relative names keep their normal components.
fn workspace_target(root: &Path, name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        return root.join(path.file_name().unwrap_or(path.as_os_str()));
    }
    let relative: PathBuf = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    root.join(relative)
}

fn copy_into(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if source.is_dir() {
        fs::create_dir_all(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_into(&entry.path(), &target.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(source, target).map(|_| ())
    }
}

/// Copy a file input into the workspace and bind it by file name
fn stage_file_input(name: &str, value: &Value, workspace: &Path) -> Result<Value> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| stage_file_input(name, item, workspace))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Value::Text(raw) => {
            let source = Path::new(raw);
            let file_name = source
                .file_name()
                .filter(|_| source.is_file())
                .ok_or_else(|| {
                    AlgorithmError::invalid_input(name, format!("file '{}' does not exist", raw))
                })?;
            fs::copy(source, workspace.join(file_name))?;
            Ok(Value::Text(file_name.to_string_lossy().into_owned()))
        }
        other => Err(AlgorithmError::invalid_input(
            name,
            format!("'{}' is not a file path", other),
        )),
    }
}

/// Copy a file output out of the workspace, returning its new absolute path
fn export_file(
    id: &str,
    output: &str,
    value: &Value,
    workspace: &Path,
    results_dir: &Path,
) -> Result<Value> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| export_file(id, output, item, workspace, results_dir))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Value::Text(raw) => {
            let source = workspace.join(raw);
            let file_name = source
                .file_name()
                .filter(|_| source.is_file())
                .ok_or_else(|| {
                    AlgorithmError::script_failed(
                        id,
                        format!("output '{}' names missing file '{}'", output, raw),
                    )
                })?;
            fs::create_dir_all(results_dir)?;
            let target = results_dir.join(file_name);
            fs::copy(&source, &target)?;
            Ok(Value::Text(std::path::absolute(&target)?.display().to_string()))
        }
        other => Err(AlgorithmError::script_failed(
            id,
            format!("output '{}' is not a file name: {}", output, other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::AnnotationParser;
    use crate::config_store::MemoryConfigStore;
    use crate::engine::pool::PoolLimits;
    use crate::engine::scripted::ScriptedConnector;
    use crate::reconciler::Reconciler;
    use crate::script_repository::DEFAULT_PREFIX;
    use std::sync::Arc;

    const ID: &str = "org.n52.wps.server.r.double";

    struct Fixture {
        dir: tempfile::TempDir,
        reconciler: Reconciler,
    }

    impl Fixture {
        fn new(script: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir(dir.path().join("scripts")).unwrap();
            fs::create_dir(dir.path().join("resources")).unwrap();
            fs::write(dir.path().join("scripts").join("double.R"), script).unwrap();
            let reconciler = Reconciler::new(
                Arc::new(MemoryConfigStore::default()),
                Arc::new(AnnotationParser),
                DEFAULT_PREFIX,
                dir.path(),
            );
            reconciler.reconcile().unwrap();
            Self { dir, reconciler }
        }

        fn algorithm(&self) -> Algorithm {
            Algorithm::load(ID, &self.reconciler.read()).unwrap()
        }

        fn run(&self, pool: &SessionPool, inputs: Inputs) -> Result<Outputs> {
            self.algorithm()
                .run(pool, &self.reconciler.catalog(), &inputs)
        }

        fn workspaces(&self) -> usize {
            fs::read_dir(self.dir.path().join("workspace"))
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_name() != "results")
                        .count()
                })
                .unwrap_or(0)
        }
    }

    fn doubling() -> Arc<ScriptedConnector> {
        Arc::new(ScriptedConnector::new().with_script("double.R", |ws| {
            match ws.number("x") {
                Some(x) => {
                    ws.set("y", x * 2.0);
                    true
                }
                None => false,
            }
        }))
    }

    fn inputs(pairs: &[(&str, Value)]) -> Inputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // =========================================================================
    // Input binding
    // =========================================================================

    #[test]
    fn test_bind_inputs_rules() {
        let fixture = Fixture::new(
            "# wps.des: double;\n\
             # wps.in: x, double;\n\
             # wps.in: n, integer, value = 4;\n\
             # wps.in: tags, string, minOccurs = 0, maxOccurs = 2;\n\
             # wps.out: y, double;\n",
        );
        let algorithm = fixture.algorithm();

        let bindings = algorithm
            .bind_inputs(&inputs(&[("x", Value::Text("1.5".into()))]))
            .unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].value, Value::Number(1.5));
        assert_eq!(bindings[1].value, Value::Integer(4));

        let err = algorithm.bind_inputs(&Inputs::new()).unwrap_err();
        assert!(matches!(&err, AlgorithmError::InvalidInput { name, .. } if name == "x"));

        let err = algorithm
            .bind_inputs(&inputs(&[("x", Value::from(1.0)), ("z", Value::from(1.0))]))
            .unwrap_err();
        assert!(err.to_string().contains("not declared"));

        let err = algorithm
            .bind_inputs(&inputs(&[("x", Value::Text("abc".into()))]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let three = Value::List(vec!["a".into(), "b".into(), "c".into()]);
        let err = algorithm
            .bind_inputs(&inputs(&[("x", Value::from(1.0)), ("tags", three)]))
            .unwrap_err();
        assert!(err.to_string().contains("between 0 and 2"));
    }

    #[test]
    fn test_invalid_description_is_reported() {
        let fixture = Fixture::new("# wps.des: double;\n# wps.in: x, double;\n");
        let err = Algorithm::load(ID, &fixture.reconciler.read()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescription);
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    #[test]
    fn test_run_doubles_input() {
        let fixture = Fixture::new("# wps.des: double;\n# wps.in: x, double;\n# wps.out: y, double;\n");
        let connector = doubling();
        let pool = SessionPool::new(connector.clone(), PoolLimits::default());

        let outputs = fixture.run(&pool, inputs(&[("x", Value::from(3.0))])).unwrap();
        assert_eq!(outputs["y"], Value::Number(6.0));

        let stats = connector.stats();
        assert_eq!(stats.open_sessions(), 0);
        assert_eq!(stats.unrestored, 0);
        assert_eq!(fixture.workspaces(), 0);
    }

    #[test]
    fn test_script_failure_still_cleans_up() {
        let fixture = Fixture::new("# wps.des: double;\n# wps.in: x, string;\n# wps.out: y, double;\n");
        let connector = doubling();
        let pool = SessionPool::new(
            connector.clone(),
            PoolLimits {
                max_idle: 1,
                max_active: 1,
            },
        );

        let err = fixture
            .run(&pool, inputs(&[("x", Value::Text("not a number".into()))]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptExecutionFailed);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(connector.stats().unrestored, 0);
        assert_eq!(fixture.workspaces(), 0);
    }

    #[test]
    fn test_missing_output_fails_whole_invocation() {
        let fixture = Fixture::new(
            "# wps.des: double;\n# wps.in: x, double;\n# wps.out: y, double;\n# wps.out: z, double;\n",
        );
        let pool = SessionPool::new(doubling(), PoolLimits::default());
        let err = fixture.run(&pool, inputs(&[("x", Value::from(1.0))])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptExecutionFailed);
        assert!(err.to_string().contains("output 'z' was not produced"));
    }

    #[test]
    fn test_lost_connection_discards_session() {
        let fixture = Fixture::new("# wps.des: double;\n# wps.out: y, double;\n");
        let connector = Arc::new(ScriptedConnector::new().with_script("double.R", |ws| {
            ws.drop_connection();
            true
        }));
        let pool = SessionPool::new(
            connector.clone(),
            PoolLimits {
                max_idle: 2,
                max_active: 0,
            },
        );

        let err = fixture.run(&pool, Inputs::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineUnreachable);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(connector.stats().open_sessions(), 0);
    }

    #[test]
    fn test_unreachable_engine_fails_at_connect() {
        let fixture = Fixture::new("# wps.des: double;\n# wps.out: y, double;\n");
        let connector = doubling();
        connector.set_reachable(false);
        let pool = SessionPool::new(connector, PoolLimits::default());

        let err = fixture.run(&pool, Inputs::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineUnreachable);
        assert_eq!(fixture.workspaces(), 0);
    }

    #[test]
    fn test_resources_and_files_move_through_workspace() {
        let fixture = Fixture::new(
            "# wps.des: double;\n\
             # wps.resource: table.csv;\n\
             # wps.out: report, file;\n",
        );
        fs::write(fixture.dir.path().join("resources").join("table.csv"), "1,2").unwrap();
        fixture.reconciler.reconcile().unwrap();

        let connector = Arc::new(ScriptedConnector::new().with_script("double.R", |ws| {
            let table = ws.cwd().join("table.csv");
            let Ok(content) = fs::read_to_string(table) else {
                return false;
            };
            if fs::write(ws.cwd().join("report.txt"), content).is_err() {
                return false;
            }
            ws.set("report", "report.txt");
            true
        }));
        let pool = SessionPool::new(connector, PoolLimits::default());

        let outputs = fixture.run(&pool, Inputs::new()).unwrap();
        let Value::Text(path) = &outputs["report"] else {
            panic!("expected a path, got {:?}", outputs["report"]);
        };
        assert!(Path::new(path).starts_with(fixture.dir.path().join("workspace").join("results")));
        assert_eq!(fs::read_to_string(path).unwrap(), "1,2");
    }

    #[test]
    fn test_missing_resource_fails_before_execute() {
        let fixture = Fixture::new(
            "# wps.des: double;\n# wps.resource: absent.csv;\n# wps.out: y, double;\n",
        );
        let connector = doubling();
        let pool = SessionPool::new(connector.clone(), PoolLimits::default());

        let err = fixture.run(&pool, Inputs::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert_eq!(connector.stats().executions, 0);
        assert_eq!(connector.stats().unrestored, 0);
    }

    #[test]
    fn test_workspace_target_stays_inside_root() {
        let root = Path::new("/ws");
        assert_eq!(workspace_target(root, "a/b.csv"), PathBuf::from("/ws/a/b.csv"));
        assert_eq!(workspace_target(root, "../../etc/passwd"), PathBuf::from("/ws/etc/passwd"));
        assert_eq!(workspace_target(root, "/data/c.csv"), PathBuf::from("/ws/c.csv"));
    }
}
