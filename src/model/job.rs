//! Jobs: user-submitted units of render work.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UnknownStatus;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Active,
    Canceled,
    Completed,
    Failed,
    Paused,
    Queued,
    CancelRequested,
    Requeueing,
    UnderConstruction,
    PauseRequested,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Queued => "queued",
            Self::CancelRequested => "cancel-requested",
            Self::Requeueing => "requeueing",
            Self::UnderConstruction => "under-construction",
            Self::PauseRequested => "pause-requested",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => Self::Active,
            "canceled" => Self::Canceled,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "paused" => Self::Paused,
            "queued" => Self::Queued,
            "cancel-requested" => Self::CancelRequested,
            "requeueing" => Self::Requeueing,
            "under-construction" => Self::UnderConstruction,
            "pause-requested" => Self::PauseRequested,
            other => {
                return Err(UnknownStatus {
                    kind: "job",
                    value: other.to_string(),
                });
            }
        })
    }
}

/// A render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Database row id; zero until the job is stored.
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub job_type: String,
    pub priority: i64,
    pub status: JobStatus,
    pub activity: String,
    /// Opaque job settings, as authored by the submitter.
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub metadata: BTreeMap<String, String>,
    /// Set when deletion was requested. Never cleared once set.
    pub delete_requested_at: Option<DateTime<Utc>>,
    /// Shaman checkout ID, only set when the job files live in shared storage.
    pub storage_checkout_id: String,
    /// Only workers with this tag may run the job.
    pub worker_tag_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A new, not yet stored job in `under-construction` status.
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            job_type: job_type.into(),
            priority: 50,
            status: JobStatus::UnderConstruction,
            activity: String::new(),
            settings: serde_json::Map::new(),
            metadata: BTreeMap::new(),
            delete_requested_at: None,
            storage_checkout_id: String::new(),
            worker_tag_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn delete_requested(&self) -> bool {
        self.delete_requested_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            JobStatus::Active,
            JobStatus::CancelRequested,
            JobStatus::UnderConstruction,
            JobStatus::PauseRequested,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        let err = "bogus".parse::<JobStatus>().unwrap_err();
        assert_eq!(err.kind, "job");
    }

    #[test]
    fn new_job_is_under_construction() {
        let job = Job::new("Sprite Fright", "simple-blender-render");
        assert_eq!(job.status, JobStatus::UnderConstruction);
        assert!(!job.delete_requested());
    }
}
