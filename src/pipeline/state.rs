use std::fmt;
use tracing::debug;

use crate::error::{DubError, Result};
use super::StageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    Loaded,
    Running,
    Executed,
    Unloaded,
    Failed,
}

impl StageState {
    fn can_become(self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Created, Loaded)
                | (Created, Failed)
                | (Loaded, Running)
                | (Running, Executed)
                | (Running, Failed)
                | (Executed, Unloaded)
                | (Failed, Unloaded)
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy)]
pub struct StageLifecycle {
    kind: StageKind,
    state: StageState,
}

impl StageLifecycle {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            state: StageState::Created,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn advance(&mut self, next: StageState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(DubError::IllegalTransition {
                subject: format!("stage '{}'", self.kind),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Stage '{}': {} -> {}", self.kind, self.state, next);
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    StageLoaded(StageKind),
    StageRunning(StageKind),
    StageUnloaded(StageKind),
    Complete,
    Failed,
}

impl RunState {
    fn can_become(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle | StageUnloaded(_), StageLoaded(_)) => true,
            (StageLoaded(a), StageRunning(b)) => a == b,
            (StageRunning(a), StageUnloaded(b)) => a == b,
            // load failed: nothing became resident
            (Idle | StageUnloaded(_), StageUnloaded(_)) => true,
            (StageUnloaded(_), Complete) => true,
            (Idle | StageUnloaded(_), Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("Idle"),
            RunState::StageLoaded(kind) => write!(f, "StageLoaded({})", kind),
            RunState::StageRunning(kind) => write!(f, "StageRunning({})", kind),
            RunState::StageUnloaded(kind) => write!(f, "StageUnloaded({})", kind),
            RunState::Complete => f.write_str("Complete"),
            RunState::Failed => f.write_str("Failed"),
        }
    }
}

/// Run-level state machine. A stage whose load fails never reaches
/// `StageLoaded` and goes straight to `StageUnloaded`.
#[derive(Debug, Clone)]
pub struct RunMachine {
    state: RunState,
}

impl RunMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(DubError::IllegalTransition {
                subject: "run".to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Run: {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }
}

impl Default for RunMachine {
    fn default() -> Self {
        Self::new()
    }
}
