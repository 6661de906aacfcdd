//! Job blocklist: workers excluded from a task type of one job after failing
//! it too often.

use chrono::Utc;
use libsql::params;
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{JobBlock, Worker};
use crate::store::Handle;
use crate::store::convert::{parse_datetime, parse_uuid, scalar_i64, timestamp};

impl Handle<'_> {
    /// Block the worker from the job's tasks of `task_type`. Adding an
    /// existing entry is a no-op.
    pub async fn add_worker_to_job_blocklist(
        &self,
        job_id: i64,
        worker: &Worker,
        task_type: &str,
    ) -> Result<(), StoreError> {
        let added = self
            .raw()
            .execute(
                "INSERT OR IGNORE INTO job_blocks (job_id, worker_id, task_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job_id, worker.id, task_type, timestamp(&Utc::now())],
            )
            .await
            .map_err(StoreError::query)?;
        if added > 0 {
            info!(job_id, worker = %worker.identifier(), task_type, "Worker added to job blocklist");
        }
        Ok(())
    }

    /// Blocklist of the job, ordered by worker name and task type.
    pub async fn fetch_job_blocklist(&self, job_id: i64) -> Result<Vec<JobBlock>, StoreError> {
        let mut rows = self
            .raw()
            .query(
                "SELECT job_blocks.job_id, workers.uuid, workers.name, job_blocks.task_type, job_blocks.created_at
                 FROM job_blocks JOIN workers ON workers.id = job_blocks.worker_id
                 WHERE job_blocks.job_id = ?1
                 ORDER BY workers.name, job_blocks.task_type",
                params![job_id],
            )
            .await
            .map_err(StoreError::query)?;

        let mut blocks = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::query)? {
            let worker_uuid: String = row.get(1).map_err(StoreError::query)?;
            let created_str: String = row.get(4).map_err(StoreError::query)?;
            blocks.push(JobBlock {
                job_id: row.get(0).map_err(StoreError::query)?,
                worker_uuid: parse_uuid(&worker_uuid)?,
                worker_name: row.get(2).map_err(StoreError::query)?,
                task_type: row.get(3).map_err(StoreError::query)?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(blocks)
    }

    pub async fn clear_job_blocklist(&self, job_id: i64) -> Result<(), StoreError> {
        self.raw()
            .execute("DELETE FROM job_blocks WHERE job_id = ?1", params![job_id])
            .await
            .map_err(StoreError::query)?;
        Ok(())
    }

    pub async fn remove_from_job_blocklist(
        &self,
        job_id: i64,
        worker_uuid: Uuid,
        task_type: &str,
    ) -> Result<bool, StoreError> {
        let removed = self
            .raw()
            .execute(
                "DELETE FROM job_blocks
                 WHERE job_id = ?1 AND task_type = ?3
                   AND worker_id = (SELECT id FROM workers WHERE uuid = ?2)",
                params![job_id, worker_uuid.to_string(), task_type],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(removed > 0)
    }

    /// How many of the job's tasks of `task_type` the worker failed.
    pub async fn count_task_failures_of_worker(
        &self,
        job_id: i64,
        worker: &Worker,
        task_type: &str,
    ) -> Result<i64, StoreError> {
        let rows = self
            .raw()
            .query(
                "SELECT COUNT(*) FROM task_failures
                 JOIN tasks ON tasks.id = task_failures.task_id
                 WHERE tasks.job_id = ?1 AND task_failures.worker_id = ?2 AND tasks.task_type = ?3",
                params![job_id, worker.id, task_type],
            )
            .await
            .map_err(StoreError::query)?;
        scalar_i64(rows).await
    }
}
