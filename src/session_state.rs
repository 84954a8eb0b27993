//! Invocation lifecycle tracking
//!
//! Every algorithm invocation walks a fixed sequence of stages against its
//! leased engine session. [`StageTracker`] enforces that ordering: stages can
//! only move forward one step at a time, a failure can be recorded from any
//! working stage, and cleanup is reachable from everywhere so teardown never
//! depends on how far the invocation got.
//!
//! # Stage Flow
//!
//! ```text
//! Pending
//!     ↓
//! Connect
//!     ↓
//! ConfigureSession
//!     ↓
//! LoadResources
//!     ↓
//! LoadInputs
//!     ↓
//! LoadImports
//!     ↓
//! Execute ──→ Failed
//!     ↓          │
//! CollectOutputs │
//!     ↓          │
//! Cleanup ←──────┘
//!     ↓
//! Close
//!
//! (Any working stage can transition to Failed; any stage before Cleanup
//! can jump to Cleanup)
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Invocation stages in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Invocation created, no session yet
    Pending = 0,

    /// Acquiring a session from the engine or the pool
    Connect = 1,

    /// Applying session options before any code loads
    ConfigureSession = 2,

    /// Copying declared resources into the workspace
    LoadResources = 3,

    /// Binding invocation inputs
    LoadInputs = 4,

    /// Sourcing imported scripts in declaration order
    LoadImports = 5,

    /// Running the script body
    Execute = 6,

    /// Reading declared outputs back
    CollectOutputs = 7,

    /// Restoring the working directory and dropping the workspace
    Cleanup = 8,

    /// Session returned to the pool or closed (terminal)
    Close = 9,

    /// A stage failed; only cleanup may follow
    Failed = 255,
}

impl Stage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true once the session has been handed back
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Close)
    }

    /// Returns true for stages that talk to the engine on behalf of the script
    #[inline]
    pub const fn is_working(self) -> bool {
        matches!(
            self,
            Self::Connect
                | Self::ConfigureSession
                | Self::LoadResources
                | Self::LoadInputs
                | Self::LoadImports
                | Self::Execute
                | Self::CollectOutputs
        )
    }

    /// Returns the next stage on the success path, or None at the end
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Connect),
            Self::Connect => Some(Self::ConfigureSession),
            Self::ConfigureSession => Some(Self::LoadResources),
            Self::LoadResources => Some(Self::LoadInputs),
            Self::LoadInputs => Some(Self::LoadImports),
            Self::LoadImports => Some(Self::Execute),
            Self::Execute => Some(Self::CollectOutputs),
            Self::CollectOutputs => Some(Self::Cleanup),
            Self::Failed => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::Close),
            Self::Close => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connect => "connect",
            Self::ConfigureSession => "configure session",
            Self::LoadResources => "load resources",
            Self::LoadInputs => "load inputs",
            Self::LoadImports => "load imports",
            Self::Execute => "execute",
            Self::CollectOutputs => "collect outputs",
            Self::Cleanup => "cleanup",
            Self::Close => "close",
            Self::Failed => "failed",
        }
    }

    /// Returns the success-path stages in order
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::Pending,
            Self::Connect,
            Self::ConfigureSession,
            Self::LoadResources,
            Self::LoadInputs,
            Self::LoadImports,
            Self::Execute,
            Self::CollectOutputs,
            Self::Cleanup,
            Self::Close,
        ]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors raised by invalid stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageTransitionError {
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage { from: Stage, to: Stage },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: Stage, to: Stage },

    #[error("Invocation already closed")]
    Closed,

    #[error("Cannot fail from {from}: not a working stage")]
    NotWorking { from: Stage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: Stage },
}

/// Forward-only stage bookkeeping for one invocation.
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: Stage,
    failed_at: Option<Stage>,
    started: Instant,
    /// Stages reached with their offset from `started`
    history: Vec<(Stage, Duration)>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: Stage::Pending,
            failed_at: None,
            started: Instant::now(),
            history: Vec::with_capacity(Stage::all_stages().len()),
        }
    }

    #[inline]
    pub fn current(&self) -> Stage {
        self.current
    }

    /// Stage at which the invocation failed, if it did
    #[inline]
    pub fn failed_at(&self) -> Option<Stage> {
        self.failed_at
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn history(&self) -> &[(Stage, Duration)] {
        &self.history
    }

    /// The furthest working stage this invocation reached
    pub fn reached(&self) -> Stage {
        self.failed_at.unwrap_or_else(|| {
            self.history
                .iter()
                .rev()
                .map(|(stage, _)| *stage)
                .find(|stage| stage.is_working())
                .unwrap_or(Stage::Pending)
        })
    }

    /// Advance to the next success-path stage.
    pub fn advance(&mut self) -> Result<Stage, StageTransitionError> {
        let next = self.current.next().ok_or(StageTransitionError::Closed)?;
        self.record(next);
        Ok(next)
    }

    /// Transition to `target`, which must be the immediate next stage.
    pub fn transition_to(&mut self, target: Stage) -> Result<Stage, StageTransitionError> {
        if self.current.is_terminal() {
            return Err(StageTransitionError::Closed);
        }
        if target == self.current {
            return Err(StageTransitionError::AlreadyAtStage { stage: target });
        }
        if target != Stage::Failed && target.order() < self.current.order() {
            return Err(StageTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(StageTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        self.record(target);
        Ok(target)
    }

    /// Record a failure at the current working stage.
    pub fn fail(&mut self) -> Result<(), StageTransitionError> {
        if !self.current.is_working() {
            return Err(StageTransitionError::NotWorking { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record(Stage::Failed);
        Ok(())
    }

    /// Jump to cleanup from wherever the invocation stopped.
    pub fn begin_cleanup(&mut self) -> Result<(), StageTransitionError> {
        match self.current {
            Stage::Close => Err(StageTransitionError::Closed),
            Stage::Cleanup => Err(StageTransitionError::AlreadyAtStage {
                stage: Stage::Cleanup,
            }),
            _ => {
                self.record(Stage::Cleanup);
                Ok(())
            }
        }
    }

    fn record(&mut self, stage: Stage) {
        self.history.push((stage, self.started.elapsed()));
        self.current = stage;
    }
}

/// Ephemeral per-invocation state, never shared between invocations.
#[derive(Debug)]
pub struct SessionState {
    pub tracker: StageTracker,
    /// Workspace directory the session works in
    pub workspace_root: PathBuf,
    /// Session working directory before the workspace was entered
    pub original_dir: Option<PathBuf>,
    pub loaded_resources: Vec<String>,
    pub loaded_inputs: Vec<String>,
    pub loaded_imports: Vec<String>,
    pub success: bool,
}

impl SessionState {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            tracker: StageTracker::new(),
            workspace_root,
            original_dir: None,
            loaded_resources: Vec::new(),
            loaded_inputs: Vec::new(),
            loaded_imports: Vec::new(),
            success: false,
        }
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.tracker.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Stage Tests
    // =========================================================================

    #[test]
    fn test_stage_order_is_sequential() {
        for (i, stage) in Stage::all_stages().iter().enumerate() {
            assert_eq!(stage.order() as usize, i, "Stage {:?} out of order", stage);
        }
    }

    #[test]
    fn test_stage_next_forms_chain() {
        let mut current = Stage::Pending;
        let mut count = 0;
        while let Some(next) = current.next() {
            current = next;
            count += 1;
            assert!(count < 20, "Infinite loop detected in stage chain");
        }
        assert_eq!(current, Stage::Close);
        assert_eq!(count, 9);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::LoadInputs.to_string(), "load inputs");
        assert_eq!(Stage::Execute.to_string(), "execute");
    }

    // =========================================================================
    // StageTracker Tests
    // =========================================================================

    #[test]
    fn test_success_path() {
        let mut tracker = StageTracker::new();
        while !tracker.is_closed() {
            tracker.advance().unwrap();
        }
        assert_eq!(tracker.history().len(), 9);
        assert_eq!(tracker.failed_at(), None);
        assert_eq!(tracker.reached(), Stage::CollectOutputs);
        assert_eq!(tracker.advance(), Err(StageTransitionError::Closed));
    }

    #[test]
    fn test_cannot_skip_stages() {
        let mut tracker = StageTracker::new();
        tracker.advance().unwrap();
        let err = tracker.transition_to(Stage::Execute).unwrap_err();
        assert!(matches!(err, StageTransitionError::SkippedStage { .. }));
        assert_eq!(tracker.current(), Stage::Connect);
    }

    #[test]
    fn test_cannot_go_backwards() {
        let mut tracker = StageTracker::new();
        tracker.advance().unwrap();
        tracker.advance().unwrap();
        let err = tracker.transition_to(Stage::Connect).unwrap_err();
        assert!(matches!(err, StageTransitionError::BackwardTransition { .. }));
    }

    #[test]
    fn test_failure_then_cleanup() {
        let mut tracker = StageTracker::new();
        for _ in 0..6 {
            tracker.advance().unwrap();
        }
        assert_eq!(tracker.current(), Stage::Execute);
        tracker.fail().unwrap();
        assert_eq!(tracker.failed_at(), Some(Stage::Execute));
        assert_eq!(tracker.reached(), Stage::Execute);

        // Only cleanup may follow a failure
        assert!(tracker.transition_to(Stage::CollectOutputs).is_err());
        tracker.begin_cleanup().unwrap();
        tracker.advance().unwrap();
        assert!(tracker.is_closed());
    }

    #[test]
    fn test_fail_requires_working_stage() {
        let mut tracker = StageTracker::new();
        assert!(tracker.fail().is_err());
        tracker.begin_cleanup().unwrap();
        assert!(tracker.fail().is_err());
        assert_eq!(
            tracker.begin_cleanup(),
            Err(StageTransitionError::AlreadyAtStage {
                stage: Stage::Cleanup
            })
        );
    }

    #[test]
    fn test_cleanup_from_pending() {
        let mut tracker = StageTracker::new();
        tracker.begin_cleanup().unwrap();
        assert_eq!(tracker.reached(), Stage::Pending);
    }

    #[test]
    fn test_session_state_starts_pending() {
        let state = SessionState::new(PathBuf::from("/tmp/ws"));
        assert_eq!(state.stage(), Stage::Pending);
        assert!(!state.success);
        assert!(state.loaded_inputs.is_empty());
    }
}
