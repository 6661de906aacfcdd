//! Worker side: runs the commands of an assigned task.
//!
//! - `state`: execution state machine (Idle → Started → Running → Completed/Failed/Interrupted)
//! - `executor`: `TaskExecutor` plus the runner and listener traits
//! - `commands`: registry of built-in commands, usable as the runner

pub mod commands;
pub mod executor;
pub mod state;

pub use commands::{CommandContext, CommandHandler, CommandRegistry};
pub use executor::{CommandRunner, TaskExecutionListener, TaskExecutor, TaskOutcome, TaskReport};
pub use state::ExecutionState;
