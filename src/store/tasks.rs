//! Task queries.

use chrono::{DateTime, Utc};
use libsql::params;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Task, TaskJobWorker, TaskStatus, Worker};
use crate::store::Handle;
use crate::store::convert::{
    opt_integer, opt_timestamp, parse_datetime, parse_optional_datetime, parse_uuid, placeholders,
    scalar_i64, timestamp,
};

const TASK_COLUMNS: &str = "tasks.id, tasks.uuid, tasks.name, tasks.task_type, tasks.job_id, tasks.priority, tasks.status, tasks.worker_id, tasks.activity, tasks.commands, tasks.last_touched_at, tasks.created_at, tasks.updated_at";
const TASK_COLUMN_COUNT: i32 = 13;

fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let uuid_str: String = row.get(1).map_err(StoreError::query)?;
    let status_str: String = row.get(6).map_err(StoreError::query)?;
    let commands_str: String = row.get(9).map_err(StoreError::query)?;
    let touched_str: Option<String> = row.get(10).ok();
    let created_str: String = row.get(11).map_err(StoreError::query)?;
    let updated_str: String = row.get(12).map_err(StoreError::query)?;

    Ok(Task {
        id: row.get(0).map_err(StoreError::query)?,
        uuid: parse_uuid(&uuid_str)?,
        name: row.get(2).map_err(StoreError::query)?,
        task_type: row.get(3).map_err(StoreError::query)?,
        job_id: row.get(4).map_err(StoreError::query)?,
        priority: row.get(5).map_err(StoreError::query)?,
        status: status_str.parse()?,
        worker_id: row.get(7).ok(),
        activity: row.get(8).map_err(StoreError::query)?,
        commands: serde_json::from_str(&commands_str)?,
        last_touched_at: parse_optional_datetime(&touched_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_tasks(mut rows: libsql::Rows) -> Result<Vec<Task>, StoreError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows.next().await.map_err(StoreError::query)? {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

fn status_values(statuses: &[TaskStatus]) -> Vec<libsql::Value> {
    statuses
        .iter()
        .map(|s| libsql::Value::Text(s.as_str().to_string()))
        .collect()
}

impl Handle<'_> {
    /// Insert a new task and fill in its database ID.
    pub async fn create_task(&self, task: &mut Task) -> Result<(), StoreError> {
        let conn = self.raw();
        conn.execute(
            "INSERT INTO tasks (uuid, name, task_type, job_id, priority, status, worker_id, activity, commands, last_touched_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.uuid.to_string(),
                task.name.as_str(),
                task.task_type.as_str(),
                task.job_id,
                task.priority,
                task.status.as_str(),
                opt_integer(task.worker_id),
                task.activity.as_str(),
                serde_json::to_string(&task.commands)?,
                opt_timestamp(task.last_touched_at.as_ref()),
                timestamp(&task.created_at),
                timestamp(&task.updated_at),
            ],
        )
        .await
        .map_err(StoreError::query)?;

        task.id = conn.last_insert_rowid();
        debug!(task = %task.uuid, job_id = task.job_id, "Task stored");
        Ok(())
    }

    pub async fn fetch_task(&self, uuid: Uuid) -> Result<Option<Task>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE tasks.uuid = ?1"),
                params![uuid.to_string()],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(collect_tasks(rows).await?.into_iter().next())
    }

    /// A task together with its job's UUID and its worker's UUID.
    pub async fn fetch_task_job_worker(&self, uuid: Uuid) -> Result<Option<TaskJobWorker>, StoreError> {
        let mut rows = self
            .raw()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS}, jobs.uuid, workers.uuid FROM tasks
                     JOIN jobs ON jobs.id = tasks.job_id
                     LEFT JOIN workers ON workers.id = tasks.worker_id
                     WHERE tasks.uuid = ?1"
                ),
                params![uuid.to_string()],
            )
            .await
            .map_err(StoreError::query)?;

        let Some(row) = rows.next().await.map_err(StoreError::query)? else {
            return Ok(None);
        };
        let task = row_to_task(&row)?;
        let job_uuid: String = row.get(TASK_COLUMN_COUNT).map_err(StoreError::query)?;
        let worker_uuid: Option<String> = row.get(TASK_COLUMN_COUNT + 1).ok();
        Ok(Some(TaskJobWorker {
            task,
            job_uuid: parse_uuid(&job_uuid)?,
            worker_uuid: worker_uuid.as_deref().map(parse_uuid).transpose()?,
        }))
    }

    /// UUID of the job owning the task.
    pub async fn fetch_task_job_uuid(&self, task_uuid: Uuid) -> Result<Option<Uuid>, StoreError> {
        let mut rows = self
            .raw()
            .query(
                "SELECT jobs.uuid FROM tasks JOIN jobs ON jobs.id = tasks.job_id WHERE tasks.uuid = ?1",
                params![task_uuid.to_string()],
            )
            .await
            .map_err(StoreError::query)?;
        match rows.next().await.map_err(StoreError::query)? {
            Some(row) => {
                let uuid_str: String = row.get(0).map_err(StoreError::query)?;
                Ok(Some(parse_uuid(&uuid_str)?))
            }
            None => Ok(None),
        }
    }

    pub async fn save_task_status(&self, task: &mut Task, status: TaskStatus) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), timestamp(&now), task.id],
            )
            .await
            .map_err(StoreError::query)?;
        debug!(task = %task.uuid, from = %task.status, to = %status, "Task status saved");
        task.status = status;
        task.updated_at = now;
        Ok(())
    }

    pub async fn save_task_activity(&self, task: &mut Task, activity: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE tasks SET activity = ?1, updated_at = ?2 WHERE id = ?3",
                params![activity, timestamp(&now), task.id],
            )
            .await
            .map_err(StoreError::query)?;
        task.activity = activity.to_string();
        task.updated_at = now;
        Ok(())
    }

    pub async fn assign_task_to_worker(&self, task: &mut Task, worker: &Worker) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE tasks SET worker_id = ?1, last_touched_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![worker.id, timestamp(&now), task.id],
            )
            .await
            .map_err(StoreError::query)?;
        debug!(task = %task.uuid, worker = %worker.identifier(), "Task assigned to worker");
        task.worker_id = Some(worker.id);
        task.last_touched_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    /// Record that the assigned worker reported on the task.
    pub async fn task_touched_by_worker(&self, task: &mut Task) -> Result<(), StoreError> {
        let now = Utc::now();
        self.raw()
            .execute(
                "UPDATE tasks SET last_touched_at = ?1 WHERE id = ?2",
                params![timestamp(&now), task.id],
            )
            .await
            .map_err(StoreError::query)?;
        task.last_touched_at = Some(now);
        Ok(())
    }

    pub async fn fetch_tasks_of_job(&self, job_id: i64) -> Result<Vec<Task>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE tasks.job_id = ?1 ORDER BY tasks.id"),
                params![job_id],
            )
            .await
            .map_err(StoreError::query)?;
        collect_tasks(rows).await
    }

    pub async fn fetch_tasks_of_job_in_status(
        &self,
        job_id: i64,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE tasks.job_id = ?1 AND tasks.status IN ({}) ORDER BY tasks.id",
            placeholders(2, statuses.len())
        );
        let mut values = vec![libsql::Value::Integer(job_id)];
        values.extend(status_values(statuses));
        let rows = self
            .raw()
            .query(&sql, values)
            .await
            .map_err(StoreError::query)?;
        collect_tasks(rows).await
    }

    /// Returns `(tasks in any of the statuses, all tasks)` for the job.
    pub async fn count_tasks_of_job_in_status(
        &self,
        job_id: i64,
        statuses: &[TaskStatus],
    ) -> Result<(i64, i64), StoreError> {
        let conn = self.raw();
        let rows = conn
            .query("SELECT COUNT(*) FROM tasks WHERE job_id = ?1", params![job_id])
            .await
            .map_err(StoreError::query)?;
        let total = scalar_i64(rows).await?;
        if statuses.is_empty() {
            return Ok((0, total));
        }

        let sql = format!(
            "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND status IN ({})",
            placeholders(2, statuses.len())
        );
        let mut values = vec![libsql::Value::Integer(job_id)];
        values.extend(status_values(statuses));
        let rows = conn.query(&sql, values).await.map_err(StoreError::query)?;
        Ok((scalar_i64(rows).await?, total))
    }

    pub async fn job_has_tasks_in_status(&self, job_id: i64, status: TaskStatus) -> Result<bool, StoreError> {
        let rows = self
            .raw()
            .query(
                "SELECT EXISTS (SELECT 1 FROM tasks WHERE job_id = ?1 AND status = ?2)",
                params![job_id, status.as_str()],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(scalar_i64(rows).await? != 0)
    }

    /// Set the status and activity of the job's tasks. With `only_from`
    /// non-empty, only tasks currently in one of those statuses change.
    /// Returns the number of updated tasks.
    pub async fn update_job_task_statuses(
        &self,
        job_id: i64,
        only_from: &[TaskStatus],
        status: TaskStatus,
        activity: &str,
    ) -> Result<u64, StoreError> {
        let mut sql =
            "UPDATE tasks SET status = ?1, activity = ?2, updated_at = ?3 WHERE job_id = ?4".to_string();
        let mut values = vec![
            libsql::Value::Text(status.as_str().to_string()),
            libsql::Value::Text(activity.to_string()),
            libsql::Value::Text(timestamp(&Utc::now())),
            libsql::Value::Integer(job_id),
        ];
        if !only_from.is_empty() {
            sql.push_str(&format!(" AND status IN ({})", placeholders(5, only_from.len())));
            values.extend(status_values(only_from));
        }

        let updated = self
            .raw()
            .execute(&sql, values)
            .await
            .map_err(StoreError::query)?;
        debug!(job_id, to = %status, updated, "Task statuses of job updated");
        Ok(updated)
    }

    /// Active tasks not touched by their worker since `untouched_since`.
    pub async fn fetch_timed_out_tasks(
        &self,
        untouched_since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE tasks.status = ?1 AND tasks.last_touched_at <= ?2
                     ORDER BY tasks.last_touched_at"
                ),
                params![TaskStatus::Active.as_str(), timestamp(&untouched_since)],
            )
            .await
            .map_err(StoreError::query)?;
        collect_tasks(rows).await
    }
}
