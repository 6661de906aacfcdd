//! Event records and the typed broadcast helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::eventbus::{EventBus, Topic};
use crate::model::{Job, JobStatus, Task, TaskStatus, Worker, WorkerStatus, WorkerTag};

/// Anything that can be broadcast. Serializes as the wrapped record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Job(JobUpdate),
    Task(TaskUpdate),
    Worker(WorkerUpdate),
    WorkerTag(WorkerTagUpdate),
    LastRendered(LastRenderedUpdate),
    TaskLog(TaskLogUpdate),
    LifeCycle(LifeCycleEvent),
    FarmStatus(FarmStatusReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: Uuid,
    pub name: String,
    pub updated: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<JobStatus>,
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: i64,
    /// Clients should reload all tasks of the job.
    #[serde(default)]
    pub refresh_tasks: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_requested_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    /// Current state of the job; `previous_status` is left for the caller.
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.uuid,
            name: job.name.clone(),
            updated: job.updated_at,
            status: job.status,
            previous_status: None,
            job_type: job.job_type.clone(),
            priority: job.priority,
            refresh_tasks: false,
            delete_requested_at: job.delete_requested_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub updated: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<TaskStatus>,
    pub activity: String,
}

impl TaskUpdate {
    pub fn from_task(task: &Task, job_uuid: Uuid) -> Self {
        Self {
            id: task.uuid,
            job_id: job_uuid,
            name: task.name.clone(),
            updated: task.updated_at,
            status: task.status,
            previous_status: None,
            activity: task.activity.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerUpdate {
    pub id: Uuid,
    pub name: String,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<WorkerStatus>,
    pub version: String,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl WorkerUpdate {
    pub fn from_worker(worker: &Worker) -> Self {
        Self {
            id: worker.uuid,
            name: worker.name.clone(),
            status: worker.status,
            previous_status: None,
            version: worker.software.clone(),
            updated: worker.updated_at,
            last_seen: worker.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTagInfo {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTagUpdate {
    pub tag: WorkerTagInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub was_deleted: Option<bool>,
}

impl WorkerTagUpdate {
    pub fn from_tag(tag: &WorkerTag) -> Self {
        Self {
            tag: WorkerTagInfo {
                id: tag.uuid,
                name: Some(tag.name.clone()),
                description: Some(tag.description.clone()),
            },
            was_deleted: None,
        }
    }

    /// Update announcing that the tag is gone.
    pub fn deleted(tag_uuid: Uuid) -> Self {
        Self {
            tag: WorkerTagInfo {
                id: tag_uuid,
                name: None,
                description: None,
            },
            was_deleted: Some(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRenderedUpdate {
    pub job_id: Uuid,
    /// URL of the preview image, filled in by whoever serves the images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl LastRenderedUpdate {
    pub fn new(job_uuid: Uuid) -> Self {
        Self {
            job_id: job_uuid,
            thumbnail: None,
        }
    }
}

/// A chunk of task log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogUpdate {
    pub task_id: Uuid,
    pub log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifeCycleType {
    ManagerStartup,
    ManagerShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeCycleEvent {
    #[serde(rename = "type")]
    pub kind: LifeCycleType,
}

impl LifeCycleEvent {
    pub fn new(kind: LifeCycleType) -> Self {
        Self { kind }
    }
}

/// Overall state of the farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FarmStatus {
    /// Working on jobs.
    Active,
    /// Could work, but there is nothing to do.
    Idle,
    /// Work is available, but no worker is awake.
    Waiting,
    /// Nothing to do and all workers are asleep.
    Asleep,
    /// No workers, or all of them are offline or in error.
    Inoperative,
    /// Not determined yet.
    Starting,
}

impl FarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Asleep => "asleep",
            Self::Inoperative => "inoperative",
            Self::Starting => "starting",
        }
    }
}

impl std::fmt::Display for FarmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmStatusReport {
    pub status: FarmStatus,
}

impl EventBus {
    /// Announce a job that was completely created, tasks included.
    pub fn broadcast_new_job(&self, mut update: JobUpdate) {
        if update.previous_status.take().is_some() {
            warn!(job = %update.id, "New jobs should not have a previous status");
        }
        debug!(job = %update.id, "Broadcasting new job");
        self.broadcast(&Topic::jobs(), &Event::Job(update));
    }

    pub fn broadcast_job_update(&self, update: JobUpdate) {
        debug!(job = %update.id, status = %update.status, "Broadcasting job update");
        self.broadcast(&Topic::jobs(), &Event::Job(update));
    }

    /// Task updates go to the topic of their job.
    pub fn broadcast_task_update(&self, update: TaskUpdate) {
        debug!(task = %update.id, status = %update.status, "Broadcasting task update");
        self.broadcast(&Topic::job(update.job_id), &Event::Task(update));
    }

    pub fn broadcast_new_worker(&self, mut update: WorkerUpdate) {
        if update.previous_status.take().is_some() {
            warn!(worker = %update.id, "New workers should not have a previous status");
        }
        debug!(worker = %update.id, "Broadcasting new worker");
        self.broadcast(&Topic::workers(), &Event::Worker(update));
    }

    pub fn broadcast_worker_update(&self, update: WorkerUpdate) {
        debug!(worker = %update.id, status = %update.status, "Broadcasting worker update");
        self.broadcast(&Topic::workers(), &Event::Worker(update));
    }

    pub fn broadcast_worker_tag_update(&self, update: WorkerTagUpdate) {
        debug!(tag = %update.tag.id, "Broadcasting worker tag update");
        self.broadcast(&Topic::worker_tags(), &Event::WorkerTag(update));
    }

    /// Sent both to the job's own last-rendered topic and the farm-wide one.
    pub fn broadcast_last_rendered(&self, update: LastRenderedUpdate) {
        debug!(job = %update.job_id, "Broadcasting last-rendered image update");
        let job_topic = Topic::job_last_rendered(update.job_id);
        let event = Event::LastRendered(update);
        self.broadcast(&job_topic, &event);
        self.broadcast(&Topic::last_rendered(), &event);
    }

    pub fn broadcast_task_log(&self, update: TaskLogUpdate) {
        // Log chunks can be large; only their size is logged.
        debug!(task = %update.task_id, bytes = update.log.len(), "Broadcasting task log");
        self.broadcast(&Topic::task_log(update.task_id), &Event::TaskLog(update));
    }

    pub fn broadcast_lifecycle(&self, event: LifeCycleEvent) {
        debug!(kind = ?event.kind, "Broadcasting lifecycle event");
        self.broadcast(&Topic::lifecycle(), &Event::LifeCycle(event));
    }

    pub fn broadcast_farm_status(&self, report: FarmStatusReport) {
        debug!(status = %report.status, "Broadcasting farm status");
        self.broadcast(&Topic::farm_status(), &Event::FarmStatus(report));
    }
}
