//! Domain entities shared by the store, the event bus and the worker.

pub mod job;
pub mod task;
pub mod worker;

pub use job::{Job, JobStatus};
pub use task::{Command, Task, TaskJobWorker, TaskStatus};
pub use worker::{JobBlock, Worker, WorkerStatus, WorkerTag};

/// Error returned when a status string read from storage is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind} status {value:?}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}
