//! Per-task lists of workers that failed the task.

use chrono::Utc;
use libsql::params;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{Task, Worker};
use crate::store::Handle;
use crate::store::convert::{scalar_i64, timestamp};
use crate::store::workers::{WORKER_COLUMNS_QUALIFIED, collect_workers};

impl Handle<'_> {
    /// Record that the worker failed the task. Adding the same worker twice
    /// is a no-op. Returns the number of distinct workers that failed it.
    pub async fn add_worker_to_task_failed_list(
        &self,
        task: &Task,
        worker: &Worker,
    ) -> Result<i64, StoreError> {
        let conn = self.raw();
        conn.execute(
            "INSERT OR IGNORE INTO task_failures (task_id, worker_id, created_at) VALUES (?1, ?2, ?3)",
            params![task.id, worker.id, timestamp(&Utc::now())],
        )
        .await
        .map_err(StoreError::query)?;

        let rows = conn
            .query(
                "SELECT COUNT(*) FROM task_failures WHERE task_id = ?1",
                params![task.id],
            )
            .await
            .map_err(StoreError::query)?;
        let count = scalar_i64(rows).await?;
        debug!(task = %task.uuid, worker = %worker.identifier(), failed_by = count, "Task failure recorded");
        Ok(count)
    }

    /// Workers that failed the task, in the order they failed it.
    pub async fn fetch_task_failure_list(&self, task: &Task) -> Result<Vec<Worker>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!(
                    "SELECT {WORKER_COLUMNS_QUALIFIED} FROM task_failures
                     JOIN workers ON workers.id = task_failures.worker_id
                     WHERE task_failures.task_id = ?1
                     ORDER BY task_failures.created_at, workers.id"
                ),
                params![task.id],
            )
            .await
            .map_err(StoreError::query)?;
        collect_workers(rows).await
    }

    pub async fn clear_failure_list_of_task(&self, task: &Task) -> Result<(), StoreError> {
        self.raw()
            .execute("DELETE FROM task_failures WHERE task_id = ?1", params![task.id])
            .await
            .map_err(StoreError::query)?;
        Ok(())
    }

    pub async fn clear_failure_list_of_job(&self, job_id: i64) -> Result<(), StoreError> {
        self.raw()
            .execute(
                "DELETE FROM task_failures WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?1)",
                params![job_id],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(())
    }
}
