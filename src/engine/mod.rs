//! Execution engine contracts
//!
//! The runtime never evaluates script code itself. It talks to an external
//! engine through two narrow traits: an [`EngineConnector`] that opens
//! sessions and the [`EngineSession`] each invocation drives. Sessions are
//! leased through [`pool::SessionPool`].
//!
//! Two connectors ship with the crate:
//! - [`rscript::RscriptConnector`] runs the configured interpreter as a child
//!   process per round trip
//! - [`scripted::ScriptedConnector`] runs Rust closures in-process and backs
//!   the test-suite and embedding

pub mod pool;
pub mod rscript;
pub mod scripted;

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::Value;

/// Errors raised by engine round trips
#[derive(Error, Debug)]
pub enum EngineError {
    /// No connection could be established
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    /// The session was closed or its connection dropped
    #[error("engine session is closed")]
    Closed,

    /// The engine answered but refused the request
    #[error("engine rejected request: {0}")]
    Rejected(String),

    /// The engine answered with something that could not be decoded
    #[error("malformed engine reply: {0}")]
    Protocol(String),

    /// A round trip exceeded the configured deadline; the session is dead
    #[error("engine round trip timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True when the error means the connection itself is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Closed | Self::Timeout(_))
    }
}

/// Opens sessions against one engine
pub trait EngineConnector: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Establish a new session.
    fn open(&self) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// One stateful engine session.
///
/// Exactly one invocation drives a session at a time; the pool hands it
/// out through an exclusive lease.
pub trait EngineSession: Send {
    /// Set a session option. Options apply before any code loads.
    fn set_option(&mut self, name: &str, value: &Value) -> Result<(), EngineError>;

    /// Evaluate an expression and return its value
    fn evaluate(&mut self, expression: &str) -> Result<Value, EngineError>;

    /// Load (source) a script file into the session workspace
    fn load_file(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Bind `value` to `name` in the session workspace
    fn assign(&mut self, name: &str, value: &Value) -> Result<(), EngineError>;

    /// Read a binding back, `None` when the name is unbound
    fn read_value(&mut self, name: &str) -> Result<Option<Value>, EngineError>;

    /// Run a script body.
    ///
    /// Returns `Ok(false)` when the script itself reported failure; `Err` is
    /// reserved for the engine failing to run it at all.
    fn execute(&mut self, script: &Path) -> Result<bool, EngineError>;

    /// Current working directory inside the session
    fn working_dir(&mut self) -> Result<PathBuf, EngineError>;

    fn change_dir(&mut self, dir: &Path) -> Result<(), EngineError>;

    /// Write a diagnostic snapshot of the workspace to `path`
    fn save_image(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Drop every binding and option so the session can be reused
    fn reset(&mut self) -> Result<(), EngineError>;

    /// False once the underlying connection is known to be dead
    fn is_alive(&self) -> bool;

    fn close(self: Box<Self>) -> Result<(), EngineError>;
}
