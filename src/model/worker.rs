//! Workers and worker tags.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UnknownStatus;

/// Status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    Starting,
    Awake,
    Asleep,
    Error,
    Offline,
    Restart,
    Testing,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Awake => "awake",
            Self::Asleep => "asleep",
            Self::Error => "error",
            Self::Offline => "offline",
            Self::Restart => "restart",
            Self::Testing => "testing",
        }
    }

    /// Workers in these statuses are exempt from timeout checks.
    pub fn exempt_from_timeout(&self) -> bool {
        matches!(self, Self::Error | Self::Offline)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "starting" => Self::Starting,
            "awake" => Self::Awake,
            "asleep" => Self::Asleep,
            "error" => Self::Error,
            "offline" => Self::Offline,
            "restart" => Self::Restart,
            "testing" => Self::Testing,
            other => {
                return Err(UnknownStatus {
                    kind: "worker",
                    value: other.to_string(),
                });
            }
        })
    }
}

/// A process executing tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    /// Network address the worker connects from.
    pub address: String,
    pub platform: String,
    /// Worker software version.
    pub software: String,
    pub status: WorkerStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub supported_task_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            address: address.into(),
            platform: String::new(),
            software: String::new(),
            status: WorkerStatus::Starting,
            last_seen_at: None,
            supported_task_types: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Human-readable identifier for log messages.
    pub fn identifier(&self) -> String {
        format!("{} ({})", self.name, self.uuid)
    }
}

/// Eligibility grouping: jobs tagged with it only run on member workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTag {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
}

impl WorkerTag {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A worker blocked from running one task type of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBlock {
    pub job_id: i64,
    pub worker_uuid: Uuid,
    pub worker_name: String,
    pub task_type: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_exemptions() {
        assert!(WorkerStatus::Offline.exempt_from_timeout());
        assert!(WorkerStatus::Error.exempt_from_timeout());
        assert!(!WorkerStatus::Awake.exempt_from_timeout());
    }

    #[test]
    fn identifier_contains_name_and_uuid() {
        let worker = Worker::new("nimble-fox", "192.168.0.12");
        let ident = worker.identifier();
        assert!(ident.starts_with("nimble-fox ("));
        assert!(ident.contains(&worker.uuid.to_string()));
    }
}
