//! Tasks and the commands they are made of.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UnknownStatus;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Active,
    Canceled,
    Completed,
    Failed,
    Queued,
    SoftFailed,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Queued => "queued",
            Self::SoftFailed => "soft-failed",
            Self::Paused => "paused",
        }
    }

}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => Self::Active,
            "canceled" => Self::Canceled,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "queued" => Self::Queued,
            "soft-failed" => Self::SoftFailed,
            "paused" => Self::Paused,
            other => {
                return Err(UnknownStatus {
                    kind: "task",
                    value: other.to_string(),
                });
            }
        })
    }
}

/// A single worker-executable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Zero means the executor counts one step for the whole command; a
    /// positive value means the command reports its own steps.
    #[serde(default)]
    pub total_step_count: u32,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: serde_json::Map::new(),
            total_step_count: 0,
        }
    }

    /// Set a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Declare the number of steps this command reports itself.
    pub fn with_steps(mut self, total_step_count: u32) -> Self {
        self.total_step_count = total_step_count;
        self
    }

    /// Whether the command does its own step reporting.
    pub fn counts_own_steps(&self) -> bool {
        self.total_step_count > 0
    }
}

/// The smallest schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub task_type: String,
    /// Row id of the owning job.
    pub job_id: i64,
    pub priority: i64,
    pub status: TaskStatus,
    /// Row id of the assigned worker, if any.
    pub worker_id: Option<i64>,
    pub activity: String,
    pub commands: Vec<Command>,
    /// Last time a worker reported on this task; used for timeout detection.
    pub last_touched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A new, not yet stored, queued task of the given job.
    pub fn new(job_id: i64, name: impl Into<String>, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            task_type: task_type.into(),
            job_id,
            priority: 50,
            status: TaskStatus::Queued,
            worker_id: None,
            activity: String::new(),
            commands: Vec::new(),
            last_touched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_commands(mut self, commands: Vec<Command>) -> Self {
        self.commands = commands;
        self
    }

    /// Total number of steps for progress reporting.
    pub fn steps_total(&self) -> u32 {
        self.commands
            .iter()
            .map(|c| c.total_step_count.max(1))
            .fold(0u32, u32::saturating_add)
    }
}

/// A task together with the UUIDs of its job and assigned worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskJobWorker {
    pub task: Task,
    pub job_uuid: Uuid,
    pub worker_uuid: Option<Uuid>,
}
