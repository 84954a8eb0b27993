//! Error handling module for the algorithm runtime
//!
//! Provides the crate-wide error type using thiserror. Every failure the
//! runtime reports to a caller is one of these variants, and each variant
//! maps onto exactly one [`ErrorKind`] for the outer protocol layer.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::annotation::ParseError;
use crate::engine::EngineError;
use crate::session_state::Stage;

/// Failure categories exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum ErrorKind {
    NotFound,
    InvalidDescription,
    ResourceUnavailable,
    EngineUnreachable,
    EngineFailure,
    ScriptExecutionFailed,
    #[strum(serialize = "ReconciliationIOError")]
    #[serde(rename = "ReconciliationIOError")]
    ReconciliationIoError,
    DuplicateIdentifier,
    InvalidInput,
    Io,
}

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum AlgorithmError {
    /// A script, algorithm, or resource identifier is not registered
    #[error("{what} '{id}' is not registered")]
    NotFound { what: &'static str, id: String },

    /// Metadata parsing or description validation failed
    #[error("Invalid description for '{id}': {}", messages.join("; "))]
    InvalidDescription { id: String, messages: Vec<String> },

    /// A declared resource cannot be resolved or became unreadable
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The execution engine cannot be connected to
    #[error("Execution engine unreachable: {0}")]
    EngineUnreachable(String),

    /// An engine round trip failed after the session was acquired
    #[error("Engine failure during {stage}: {source}")]
    Engine {
        stage: Stage,
        #[source]
        source: EngineError,
    },

    /// The script ran and reported failure, or did not produce an output
    #[error("Script execution failed for '{id}': {message}")]
    ScriptExecutionFailed { id: String, message: String },

    /// Persisting or reading the configuration store failed
    #[error("Reconciliation I/O error: {0}")]
    ReconciliationIo(String),

    /// Two script files derive the same public identifier
    #[error("Duplicate script identifier '{id}': {existing} already registered, rejecting {candidate}")]
    DuplicateScript {
        id: String,
        existing: String,
        candidate: String,
    },

    /// Supplied invocation inputs do not match the declared inputs
    #[error("Invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    /// IO errors (workspace preparation, file copies)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, AlgorithmError>;

// Convenient error constructors
impl AlgorithmError {
    /// Unknown algorithm identifier
    pub fn algorithm_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "Algorithm",
            id: id.into(),
        }
    }

    /// Unknown script identifier
    pub fn script_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "Script",
            id: id.into(),
        }
    }

    /// Missing or undeclared invocation input
    pub fn invalid_input(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Script-reported failure
    pub fn script_failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptExecutionFailed {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Metadata of script `id` could not be parsed
    pub fn unparseable(id: impl Into<String>, err: &ParseError) -> Self {
        Self::InvalidDescription {
            id: id.into(),
            messages: vec![err.to_string()],
        }
    }

    /// Wrap an engine error raised while driving `stage`
    pub fn engine(stage: Stage, source: EngineError) -> Self {
        Self::Engine { stage, source }
    }

    /// The category this error is reported under
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidDescription { .. } => ErrorKind::InvalidDescription,
            Self::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            Self::EngineUnreachable(_) => ErrorKind::EngineUnreachable,
            Self::Engine { source, .. } if source.is_connection_loss() => {
                ErrorKind::EngineUnreachable
            }
            Self::Engine { .. } => ErrorKind::EngineFailure,
            Self::ScriptExecutionFailed { .. } => ErrorKind::ScriptExecutionFailed,
            Self::ReconciliationIo(_) => ErrorKind::ReconciliationIoError,
            Self::DuplicateScript { .. } => ErrorKind::DuplicateIdentifier,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Collapse into the single structured failure handed to the outer layer
    pub fn report(&self) -> FailureReport {
        FailureReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured failure result of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<EngineError> for AlgorithmError {
    fn from(err: EngineError) -> Self {
        if err.is_connection_loss() {
            Self::EngineUnreachable(err.to_string())
        } else {
            Self::Engine {
                stage: Stage::Pending,
                source: err,
            }
        }
    }
}

impl From<ParseError> for AlgorithmError {
    fn from(err: ParseError) -> Self {
        Self::InvalidDescription {
            id: String::new(),
            messages: vec![err.to_string()],
        }
    }
}

impl From<&AlgorithmError> for FailureReport {
    fn from(err: &AlgorithmError) -> Self {
        err.report()
    }
}
