//! In-process engine driven by Rust closures
//!
//! Script behaviour is registered by file name. When a session executes or
//! loads a file with that name the closure runs against the session's
//! [`ScriptedWorkspace`]. The connector keeps counters so callers can assert
//! that sessions were closed, pooled and had their working directory put back.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use super::{EngineConnector, EngineError, EngineSession};
use crate::types::Value;

/// Script body: returns `false` to report script failure
pub type Behaviour = Arc<dyn Fn(&mut ScriptedWorkspace) -> bool + Send + Sync>;

/// Variable table and session state visible to a behaviour
#[derive(Debug, Clone)]
pub struct ScriptedWorkspace {
    vars: HashMap<String, Value>,
    options: BTreeMap<String, Value>,
    cwd: PathBuf,
    loaded: Vec<PathBuf>,
    disconnected: bool,
}

impl ScriptedWorkspace {
    fn new(cwd: PathBuf) -> Self {
        Self {
            vars: HashMap::new(),
            options: BTreeMap::new(),
            cwd,
            loaded: Vec::new(),
            disconnected: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Numeric binding as f64, scalar integers included
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.vars.get(name)? {
            Value::Number(n) => Some(*n),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.vars.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    /// Working directory the script runs in
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Files loaded so far, in order
    pub fn loaded(&self) -> &[PathBuf] {
        &self.loaded
    }

    /// Simulate the connection dropping mid round trip
    pub fn drop_connection(&mut self) {
        self.disconnected = true;
    }
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    resets: AtomicUsize,
    executions: AtomicUsize,
    unrestored: AtomicUsize,
}

/// Point-in-time copy of the connector counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub opened: usize,
    pub closed: usize,
    /// Sessions reset for reuse by the pool
    pub resets: usize,
    pub executions: usize,
    /// Sessions closed or reset while away from their starting directory
    pub unrestored: usize,
}

impl EngineStats {
    pub fn open_sessions(&self) -> usize {
        self.opened.saturating_sub(self.closed)
    }
}

/// Connector whose sessions run registered closures
pub struct ScriptedConnector {
    behaviours: Arc<RwLock<HashMap<String, Behaviour>>>,
    reachable: AtomicBool,
    counters: Arc<Counters>,
    home: PathBuf,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            behaviours: Arc::new(RwLock::new(HashMap::new())),
            reachable: AtomicBool::new(true),
            counters: Arc::new(Counters::default()),
            home: std::env::temp_dir(),
        }
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_script<F>(self, file_name: &str, behaviour: F) -> Self
    where
        F: Fn(&mut ScriptedWorkspace) -> bool + Send + Sync + 'static,
    {
        self.register(file_name, behaviour);
        self
    }

    /// Run `behaviour` whenever a file named `file_name` is executed or loaded
    pub fn register<F>(&self, file_name: &str, behaviour: F)
    where
        F: Fn(&mut ScriptedWorkspace) -> bool + Send + Sync + 'static,
    {
        self.behaviours
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file_name.to_string(), Arc::new(behaviour));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            opened: c.opened.load(Ordering::SeqCst),
            closed: c.closed.load(Ordering::SeqCst),
            resets: c.resets.load(Ordering::SeqCst),
            executions: c.executions.load(Ordering::SeqCst),
            unrestored: c.unrestored.load(Ordering::SeqCst),
        }
    }
}

impl EngineConnector for ScriptedConnector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(EngineError::Unreachable(
                "scripted engine marked unreachable".to_string(),
            ));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            behaviours: self.behaviours.clone(),
            counters: self.counters.clone(),
            home: self.home.clone(),
            workspace: ScriptedWorkspace::new(self.home.clone()),
            alive: true,
        }))
    }
}

struct ScriptedSession {
    behaviours: Arc<RwLock<HashMap<String, Behaviour>>>,
    counters: Arc<Counters>,
    home: PathBuf,
    workspace: ScriptedWorkspace,
    alive: bool,
}

impl ScriptedSession {
    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.alive {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }

    fn behaviour_for(&self, path: &Path) -> Option<Behaviour> {
        let name = path.file_name()?.to_str()?;
        self.behaviours
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn run(&mut self, behaviour: &Behaviour) -> Result<bool, EngineError> {
        let ok = behaviour(&mut self.workspace);
        if self.workspace.disconnected {
            self.alive = false;
            return Err(EngineError::Closed);
        }
        Ok(ok)
    }

    fn note_restore(&self) {
        if self.workspace.cwd != self.home {
            self.counters.unrestored.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl EngineSession for ScriptedSession {
    fn set_option(&mut self, name: &str, value: &Value) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.workspace.options.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> Result<Value, EngineError> {
        self.ensure_alive()?;
        let expression = expression.trim();
        if let Some(value) = self.workspace.vars.get(expression) {
            return Ok(value.clone());
        }
        match Value::parse_literal(expression) {
            Value::Text(_) => Err(EngineError::Rejected(format!(
                "cannot evaluate '{}'",
                expression
            ))),
            literal => Ok(literal),
        }
    }

    fn load_file(&mut self, path: &Path) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if !path.is_file() {
            return Err(EngineError::Rejected(format!(
                "cannot open file '{}'",
                path.display()
            )));
        }
        self.workspace.loaded.push(path.to_path_buf());
        if let Some(behaviour) = self.behaviour_for(path) {
            if !self.run(&behaviour)? {
                return Err(EngineError::Rejected(format!(
                    "error while loading '{}'",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn assign(&mut self, name: &str, value: &Value) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.workspace.vars.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn read_value(&mut self, name: &str) -> Result<Option<Value>, EngineError> {
        self.ensure_alive()?;
        Ok(self.workspace.vars.get(name).cloned())
    }

    fn execute(&mut self, script: &Path) -> Result<bool, EngineError> {
        self.ensure_alive()?;
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.behaviour_for(script).ok_or_else(|| {
            EngineError::Rejected(format!("no behaviour for '{}'", script.display()))
        })?;
        debug!("Scripted engine executing {}", script.display());
        self.run(&behaviour)
    }

    fn working_dir(&mut self) -> Result<PathBuf, EngineError> {
        self.ensure_alive()?;
        Ok(self.workspace.cwd.clone())
    }

    fn change_dir(&mut self, dir: &Path) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if !dir.is_dir() {
            return Err(EngineError::Rejected(format!(
                "cannot change working directory to '{}'",
                dir.display()
            )));
        }
        self.workspace.cwd = dir.to_path_buf();
        Ok(())
    }

    fn save_image(&mut self, path: &Path) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let mut names: Vec<&String> = self.workspace.vars.keys().collect();
        names.sort();
        let listing: Vec<String> = names
            .into_iter()
            .map(|name| format!("{} = {}", name, self.workspace.vars[name]))
            .collect();
        std::fs::write(path, listing.join("\n"))?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.note_restore();
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        self.workspace = ScriptedWorkspace::new(self.home.clone());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        if self.alive {
            self.note_restore();
        }
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_runs_registered_behaviour() {
        let connector = ScriptedConnector::new().with_script("double.R", |ws| {
            let x = ws.number("x").unwrap_or(0.0);
            ws.set("y", x * 2.0);
            true
        });
        let mut session = connector.open().unwrap();
        session.assign("x", &Value::Integer(4)).unwrap();
        assert!(session.execute(Path::new("/scripts/double.R")).unwrap());
        assert_eq!(session.read_value("y").unwrap(), Some(Value::Number(8.0)));
        assert_eq!(connector.stats().executions, 1);
    }

    #[test]
    fn test_unknown_script_is_rejected() {
        let connector = ScriptedConnector::new();
        let mut session = connector.open().unwrap();
        let err = session.execute(Path::new("missing.R")).unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
    }

    #[test]
    fn test_dropped_connection_kills_session() {
        let connector = ScriptedConnector::new().with_script("crash.R", |ws| {
            ws.drop_connection();
            true
        });
        let mut session = connector.open().unwrap();
        let err = session.execute(Path::new("crash.R")).unwrap_err();
        assert!(err.is_connection_loss());
        assert!(!session.is_alive());
        assert!(session.read_value("x").is_err());
    }

    #[test]
    fn test_unrestored_directory_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        let mut session = connector.open().unwrap();
        let home = session.working_dir().unwrap();
        session.change_dir(dir.path()).unwrap();
        session.change_dir(&home).unwrap();
        session.close().unwrap();
        assert_eq!(connector.stats().unrestored, 0);

        let mut session = connector.open().unwrap();
        session.change_dir(dir.path()).unwrap();
        session.close().unwrap();
        assert_eq!(connector.stats().unrestored, 1);
    }

    #[test]
    fn test_evaluate_reads_bindings_and_literals() {
        let connector = ScriptedConnector::new();
        let mut session = connector.open().unwrap();
        session.assign("n", &Value::Integer(3)).unwrap();
        assert_eq!(session.evaluate("n").unwrap(), Value::Integer(3));
        assert_eq!(session.evaluate("2.5").unwrap(), Value::Number(2.5));
        assert!(session.evaluate("sum(1, 2)").is_err());
    }
}
