//! Event topics.

use std::fmt;

use uuid::Uuid;

pub const JOBS: &str = "/jobs";
pub const WORKERS: &str = "/workers";
pub const WORKER_TAGS: &str = "/workertags";
pub const LAST_RENDERED: &str = "/last-rendered";
pub const FARM_STATUS: &str = "/status";
pub const LIFECYCLE: &str = "/lifecycle";

/// Name of the channel an event is published on. Forwarders prepend their own
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn jobs() -> Self {
        Self(JOBS.to_string())
    }

    /// Updates scoped to one job, such as the updates of its tasks.
    pub fn job(job_uuid: Uuid) -> Self {
        Self(format!("{JOBS}/{job_uuid}"))
    }

    pub fn job_last_rendered(job_uuid: Uuid) -> Self {
        Self(format!("{JOBS}/{job_uuid}{LAST_RENDERED}"))
    }

    pub fn workers() -> Self {
        Self(WORKERS.to_string())
    }

    pub fn worker_tags() -> Self {
        Self(WORKER_TAGS.to_string())
    }

    pub fn last_rendered() -> Self {
        Self(LAST_RENDERED.to_string())
    }

    pub fn task_log(task_uuid: Uuid) -> Self {
        Self(format!("/tasklog/{task_uuid}"))
    }

    pub fn farm_status() -> Self {
        Self(FARM_STATUS.to_string())
    }

    pub fn lifecycle() -> Self {
        Self(LIFECYCLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
