//! Task execution state machine.

use serde::{Deserialize, Serialize};

/// Where the executor is in running one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Nothing has happened yet.
    Idle,
    /// The listener was told the task started; no command ran yet.
    Started,
    /// A command is running or just finished.
    Running,
    /// Every command succeeded.
    Completed,
    /// A command failed; the remaining commands were skipped.
    Failed,
    /// Execution was cancelled.
    Interrupted,
}

impl ExecutionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ExecutionState) -> bool {
        use ExecutionState::*;

        matches!(
            (self, target),
            (Idle, Started) |
            // A task without commands completes right away.
            (Started, Running) | (Started, Completed) | (Started, Interrupted) |
            (Running, Running) | (Running, Completed) |
            (Running, Failed) | (Running, Interrupted)
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{s}")
    }
}
