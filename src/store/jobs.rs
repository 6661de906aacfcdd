//! Job queries.

use chrono::{DateTime, Utc};
use libsql::params;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Job, JobStatus};
use crate::store::Handle;
use crate::store::convert::{
    opt_integer, opt_timestamp, parse_datetime, parse_optional_datetime, parse_uuid, placeholders,
    timestamp,
};

pub(crate) const JOB_COLUMNS: &str = "id, uuid, name, job_type, priority, status, activity, settings, metadata, delete_requested_at, storage_checkout_id, worker_tag_id, created_at, updated_at";

/// Number of jobs in one status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusCount {
    pub status: JobStatus,
    pub count: i64,
}

/// Map a libsql Row to a Job.
fn row_to_job(row: &libsql::Row) -> Result<Job, StoreError> {
    let uuid_str: String = row.get(1).map_err(StoreError::query)?;
    let status_str: String = row.get(5).map_err(StoreError::query)?;
    let settings_str: String = row.get(7).map_err(StoreError::query)?;
    let metadata_str: String = row.get(8).map_err(StoreError::query)?;
    let delete_requested_str: Option<String> = row.get(9).ok();
    let created_str: String = row.get(12).map_err(StoreError::query)?;
    let updated_str: String = row.get(13).map_err(StoreError::query)?;

    Ok(Job {
        id: row.get(0).map_err(StoreError::query)?,
        uuid: parse_uuid(&uuid_str)?,
        name: row.get(2).map_err(StoreError::query)?,
        job_type: row.get(3).map_err(StoreError::query)?,
        priority: row.get(4).map_err(StoreError::query)?,
        status: status_str.parse()?,
        activity: row.get(6).map_err(StoreError::query)?,
        settings: serde_json::from_str(&settings_str)?,
        metadata: serde_json::from_str(&metadata_str)?,
        delete_requested_at: parse_optional_datetime(&delete_requested_str),
        storage_checkout_id: row.get(10).map_err(StoreError::query)?,
        worker_tag_id: row.get(11).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

pub(crate) async fn collect_jobs(mut rows: libsql::Rows) -> Result<Vec<Job>, StoreError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows.next().await.map_err(StoreError::query)? {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

impl Handle<'_> {
    /// Insert a new job and fill in its database ID.
    pub async fn create_job(&self, job: &mut Job) -> Result<(), StoreError> {
        let conn = self.raw();
        conn.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                JOB_COLUMNS
            ),
            params![
                job.uuid.to_string(),
                job.name.as_str(),
                job.job_type.as_str(),
                job.priority,
                job.status.as_str(),
                job.activity.as_str(),
                serde_json::to_string(&job.settings)?,
                serde_json::to_string(&job.metadata)?,
                opt_timestamp(job.delete_requested_at.as_ref()),
                job.storage_checkout_id.as_str(),
                opt_integer(job.worker_tag_id),
                timestamp(&job.created_at),
                timestamp(&job.updated_at),
            ],
        )
        .await
        .map_err(StoreError::query)?;

        job.id = conn.last_insert_rowid();
        debug!(job = %job.uuid, id = job.id, "Job stored");
        Ok(())
    }

    pub async fn fetch_job(&self, uuid: Uuid) -> Result<Option<Job>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE uuid = ?1"),
                params![uuid.to_string()],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(collect_jobs(rows).await?.into_iter().next())
    }

    pub async fn fetch_job_by_id(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(collect_jobs(rows).await?.into_iter().next())
    }

    /// Jobs in any of the given statuses, oldest first.
    pub async fn fetch_jobs_in_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({}) ORDER BY created_at, id",
            placeholders(1, statuses.len())
        );
        let values: Vec<libsql::Value> = statuses
            .iter()
            .map(|s| libsql::Value::Text(s.as_str().to_string()))
            .collect();
        let rows = self
            .raw()
            .query(&sql, values)
            .await
            .map_err(StoreError::query)?;
        collect_jobs(rows).await
    }

    pub async fn save_job_status(
        &self,
        job: &mut Job,
        status: JobStatus,
        activity: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE jobs SET status = ?1, activity = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), activity, timestamp(&now), job.id],
            )
            .await
            .map_err(StoreError::query)?;

        debug!(job = %job.uuid, from = %job.status, to = %status, "Job status saved");
        job.status = status;
        job.activity = activity.to_string();
        job.updated_at = now;
        Ok(())
    }

    pub async fn save_job_priority(&self, job: &mut Job, priority: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE jobs SET priority = ?1, updated_at = ?2 WHERE id = ?3",
                params![priority, timestamp(&now), job.id],
            )
            .await
            .map_err(StoreError::query)?;
        job.priority = priority;
        job.updated_at = now;
        Ok(())
    }

    pub async fn save_job_activity(&self, job: &mut Job, activity: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE jobs SET activity = ?1, updated_at = ?2 WHERE id = ?3",
                params![activity, timestamp(&now), job.id],
            )
            .await
            .map_err(StoreError::query)?;
        job.activity = activity.to_string();
        job.updated_at = now;
        Ok(())
    }

    /// Mark the job for deletion. A job already marked keeps its first
    /// timestamp.
    pub async fn request_job_deletion(&self, job: &mut Job) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE jobs SET delete_requested_at = COALESCE(delete_requested_at, ?1), updated_at = ?1
                 WHERE id = ?2",
                params![timestamp(&now), job.id],
            )
            .await
            .map_err(StoreError::query)?;

        if job.delete_requested_at.is_none() {
            job.delete_requested_at = Some(now);
        }
        job.updated_at = now;
        info!(job = %job.uuid, "Job deletion requested");
        Ok(())
    }

    /// Mark every job last updated at or before `last_updated_max` for
    /// deletion, returning the UUIDs of the newly marked jobs.
    pub async fn request_job_mass_deletion(
        &self,
        last_updated_max: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.raw();
        let mut rows = conn
            .query(
                "SELECT uuid FROM jobs
                 WHERE updated_at <= ?1 AND delete_requested_at IS NULL
                 ORDER BY updated_at",
                params![timestamp(&last_updated_max)],
            )
            .await
            .map_err(StoreError::query)?;
        let mut uuids = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::query)? {
            let uuid_str: String = row.get(0).map_err(StoreError::query)?;
            uuids.push(parse_uuid(&uuid_str)?);
        }
        if uuids.is_empty() {
            return Ok(uuids);
        }

        let now = timestamp(&Utc::now());
        conn.execute(
            "UPDATE jobs SET delete_requested_at = ?1, updated_at = ?1
             WHERE updated_at <= ?2 AND delete_requested_at IS NULL",
            params![now, timestamp(&last_updated_max)],
        )
        .await
        .map_err(StoreError::query)?;

        info!(count = uuids.len(), "Mass job deletion requested");
        Ok(uuids)
    }

    /// UUIDs of jobs marked for deletion, in the order they were marked.
    pub async fn fetch_jobs_deletion_requested(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut rows = self
            .raw()
            .query(
                "SELECT uuid FROM jobs WHERE delete_requested_at IS NOT NULL
                 ORDER BY delete_requested_at, id",
                (),
            )
            .await
            .map_err(StoreError::query)?;
        let mut uuids = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::query)? {
            let uuid_str: String = row.get(0).map_err(StoreError::query)?;
            uuids.push(parse_uuid(&uuid_str)?);
        }
        Ok(uuids)
    }

    /// Hard-delete a job. Its tasks, failure lists, blocklist and
    /// last-rendered record go with it through cascading foreign keys, so
    /// the deletion is refused when those are not enforced.
    pub async fn delete_job(&self, uuid: Uuid) -> Result<bool, StoreError> {
        if !self.foreign_keys_enabled().await? {
            return Err(StoreError::DeletingWithoutForeignKeys);
        }
        let affected = self
            .raw()
            .execute("DELETE FROM jobs WHERE uuid = ?1", params![uuid.to_string()])
            .await
            .map_err(StoreError::query)?;
        if affected > 0 {
            info!(job = %uuid, "Job deleted");
        }
        Ok(affected > 0)
    }

    pub async fn summarize_job_statuses(&self) -> Result<Vec<JobStatusCount>, StoreError> {
        let mut rows = self
            .raw()
            .query(
                "SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status",
                (),
            )
            .await
            .map_err(StoreError::query)?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::query)? {
            let status_str: String = row.get(0).map_err(StoreError::query)?;
            counts.push(JobStatusCount {
                status: status_str.parse()?,
                count: row.get(1).map_err(StoreError::query)?,
            });
        }
        Ok(counts)
    }
}
