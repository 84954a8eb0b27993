//! wpsr Library
//!
//! Algorithm registry and execution runtime for script-backed web
//! processing services: script discovery, configuration reconciliation,
//! resource resolution, engine session leasing and the invocation lifecycle.

pub mod algorithm;
pub mod annotation;
pub mod cli;
pub mod config_store;
pub mod description;
pub mod engine;
pub mod error;
pub mod process_guard;
pub mod reconciler;
pub mod registry;
pub mod resource_index;
pub mod runtime;
pub mod script_repository;
pub mod script_runner;
pub mod session_state;
pub mod settings;
pub mod types;

// Re-export main types for convenience
pub use algorithm::Algorithm;
pub use annotation::{Annotation, AnnotationParser, AnnotationType, MetadataParser, ParseError};
pub use config_store::{
    ConfigEntry, ConfigEvent, ConfigStore, JsonConfigStore, MemoryConfigStore, RepositoryConfig,
    StoreError,
};
pub use description::{InputDescription, OutputDescription, ProcessDescription};
pub use engine::pool::{PoolLimits, SessionLease, SessionPool};
pub use engine::rscript::RscriptConnector;
pub use engine::scripted::ScriptedConnector;
pub use engine::{EngineConnector, EngineError, EngineSession};
pub use error::{AlgorithmError, ErrorKind, FailureReport, Result};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use reconciler::{Catalog, ReconcileReport, Reconciler};
pub use registry::{AlgorithmRegistry, RegistryState};
pub use resource_index::{ResourceHandle, ResourceIndex};
pub use runtime::{RuntimeBuilder, RuntimeContext};
pub use script_repository::{ScriptDescriptor, ScriptRepository};
pub use session_state::{SessionState, Stage, StageTracker};
pub use settings::{ConfigVariable, RuntimeSettings};
pub use types::{DataType, Inputs, Outputs, Value};
