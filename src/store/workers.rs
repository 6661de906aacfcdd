//! Worker queries.

use chrono::{DateTime, Utc};
use libsql::params;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Worker, WorkerStatus};
use crate::store::Handle;
use crate::store::convert::{
    join_list, opt_timestamp, parse_datetime, parse_optional_datetime, parse_uuid, split_list,
    timestamp,
};

pub(crate) const WORKER_COLUMNS_QUALIFIED: &str = "workers.id, workers.uuid, workers.name, workers.address, workers.platform, workers.software, workers.status, workers.last_seen_at, workers.supported_task_types, workers.created_at, workers.updated_at";

/// Number of workers in one status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatusCount {
    pub status: WorkerStatus,
    pub count: i64,
}

fn row_to_worker(row: &libsql::Row) -> Result<Worker, StoreError> {
    let uuid_str: String = row.get(1).map_err(StoreError::query)?;
    let status_str: String = row.get(6).map_err(StoreError::query)?;
    let seen_str: Option<String> = row.get(7).ok();
    let task_types: String = row.get(8).map_err(StoreError::query)?;
    let created_str: String = row.get(9).map_err(StoreError::query)?;
    let updated_str: String = row.get(10).map_err(StoreError::query)?;

    Ok(Worker {
        id: row.get(0).map_err(StoreError::query)?,
        uuid: parse_uuid(&uuid_str)?,
        name: row.get(2).map_err(StoreError::query)?,
        address: row.get(3).map_err(StoreError::query)?,
        platform: row.get(4).map_err(StoreError::query)?,
        software: row.get(5).map_err(StoreError::query)?,
        status: status_str.parse()?,
        last_seen_at: parse_optional_datetime(&seen_str),
        supported_task_types: split_list(&task_types),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

pub(crate) async fn collect_workers(mut rows: libsql::Rows) -> Result<Vec<Worker>, StoreError> {
    let mut workers = Vec::new();
    while let Some(row) = rows.next().await.map_err(StoreError::query)? {
        workers.push(row_to_worker(&row)?);
    }
    Ok(workers)
}

impl Handle<'_> {
    /// Insert a new worker and fill in its database ID.
    pub async fn create_worker(&self, worker: &mut Worker) -> Result<(), StoreError> {
        let conn = self.raw();
        conn.execute(
            "INSERT INTO workers (uuid, name, address, platform, software, status, last_seen_at, supported_task_types, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                worker.uuid.to_string(),
                worker.name.as_str(),
                worker.address.as_str(),
                worker.platform.as_str(),
                worker.software.as_str(),
                worker.status.as_str(),
                opt_timestamp(worker.last_seen_at.as_ref()),
                join_list(&worker.supported_task_types),
                timestamp(&worker.created_at),
                timestamp(&worker.updated_at),
            ],
        )
        .await
        .map_err(StoreError::query)?;

        worker.id = conn.last_insert_rowid();
        info!(worker = %worker.identifier(), "Worker registered");
        Ok(())
    }

    pub async fn fetch_worker(&self, uuid: Uuid) -> Result<Option<Worker>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {WORKER_COLUMNS_QUALIFIED} FROM workers WHERE workers.uuid = ?1"),
                params![uuid.to_string()],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(collect_workers(rows).await?.into_iter().next())
    }

    /// All workers, ordered by name.
    pub async fn fetch_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {WORKER_COLUMNS_QUALIFIED} FROM workers ORDER BY workers.name, workers.id"),
                (),
            )
            .await
            .map_err(StoreError::query)?;
        collect_workers(rows).await
    }

    /// Write all mutable fields of the worker.
    pub async fn save_worker(&self, worker: &mut Worker) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE workers SET name = ?1, address = ?2, platform = ?3, software = ?4, status = ?5,
                 last_seen_at = ?6, supported_task_types = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    worker.name.as_str(),
                    worker.address.as_str(),
                    worker.platform.as_str(),
                    worker.software.as_str(),
                    worker.status.as_str(),
                    opt_timestamp(worker.last_seen_at.as_ref()),
                    join_list(&worker.supported_task_types),
                    timestamp(&now),
                    worker.id,
                ],
            )
            .await
            .map_err(StoreError::query)?;
        worker.updated_at = now;
        Ok(())
    }

    pub async fn save_worker_status(&self, worker: &mut Worker, status: WorkerStatus) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE workers SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), timestamp(&now), worker.id],
            )
            .await
            .map_err(StoreError::query)?;
        debug!(worker = %worker.identifier(), from = %worker.status, to = %status, "Worker status saved");
        worker.status = status;
        worker.updated_at = now;
        Ok(())
    }

    /// Record that the worker contacted the manager.
    pub async fn worker_seen(&self, worker: &mut Worker) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE workers SET last_seen_at = ?1 WHERE id = ?2",
                params![timestamp(&now), worker.id],
            )
            .await
            .map_err(StoreError::query)?;
        worker.last_seen_at = Some(now);
        Ok(())
    }

    /// Delete the worker. Its tasks become unassigned through the foreign
    /// key, so the deletion is refused when those are not enforced.
    pub async fn delete_worker(&self, uuid: Uuid) -> Result<bool, StoreError> {
        if !self.foreign_keys_enabled().await? {
            return Err(StoreError::DeletingWithoutForeignKeys);
        }
        let affected = self
            .raw()
            .execute("DELETE FROM workers WHERE uuid = ?1", params![uuid.to_string()])
            .await
            .map_err(StoreError::query)?;
        if affected > 0 {
            info!(worker = %uuid, "Worker deleted");
        }
        Ok(affected > 0)
    }

    pub async fn summarize_worker_statuses(&self) -> Result<Vec<WorkerStatusCount>, StoreError> {
        let mut rows = self
            .raw()
            .query(
                "SELECT status, COUNT(*) FROM workers GROUP BY status ORDER BY status",
                (),
            )
            .await
            .map_err(StoreError::query)?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(StoreError::query)? {
            let status_str: String = row.get(0).map_err(StoreError::query)?;
            counts.push(WorkerStatusCount {
                status: status_str.parse()?,
                count: row.get(1).map_err(StoreError::query)?,
            });
        }
        Ok(counts)
    }

    /// Workers not seen since `last_seen_before`. Workers already in `error`
    /// or `offline` status are not considered timed out.
    pub async fn fetch_timed_out_workers(
        &self,
        last_seen_before: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!(
                    "SELECT {WORKER_COLUMNS_QUALIFIED} FROM workers
                     WHERE workers.last_seen_at <= ?1 AND workers.status NOT IN (?2, ?3)
                     ORDER BY workers.last_seen_at"
                ),
                params![
                    timestamp(&last_seen_before),
                    WorkerStatus::Error.as_str(),
                    WorkerStatus::Offline.as_str(),
                ],
            )
            .await
            .map_err(StoreError::query)?;
        collect_workers(rows).await
    }
}
