//! Worker tags and tag membership.

use libsql::params;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Worker, WorkerTag};
use crate::store::Handle;
use crate::store::convert::{parse_uuid, placeholders, scalar_i64};

const TAG_COLUMNS: &str = "worker_tags.id, worker_tags.uuid, worker_tags.name, worker_tags.description";

async fn collect_tags(mut rows: libsql::Rows) -> Result<Vec<WorkerTag>, StoreError> {
    let mut tags = Vec::new();
    while let Some(row) = rows.next().await.map_err(StoreError::query)? {
        let uuid_str: String = row.get(1).map_err(StoreError::query)?;
        tags.push(WorkerTag {
            id: row.get(0).map_err(StoreError::query)?,
            uuid: parse_uuid(&uuid_str)?,
            name: row.get(2).map_err(StoreError::query)?,
            description: row.get(3).map_err(StoreError::query)?,
        });
    }
    Ok(tags)
}

async fn replace_memberships(
    conn: &libsql::Connection,
    worker_id: i64,
    tag_uuids: &[Uuid],
) -> Result<u64, StoreError> {
    conn.execute(
        "DELETE FROM worker_tag_membership WHERE worker_id = ?1",
        params![worker_id],
    )
    .await
    .map_err(StoreError::query)?;
    if tag_uuids.is_empty() {
        return Ok(0);
    }

    let sql = format!(
        "INSERT INTO worker_tag_membership (worker_tag_id, worker_id)
         SELECT id, ?1 FROM worker_tags WHERE uuid IN ({})",
        placeholders(2, tag_uuids.len())
    );
    let mut values = vec![libsql::Value::Integer(worker_id)];
    values.extend(tag_uuids.iter().map(|u| libsql::Value::Text(u.to_string())));
    conn.execute(&sql, values).await.map_err(StoreError::query)
}

impl Handle<'_> {
    pub async fn create_worker_tag(&self, tag: &mut WorkerTag) -> Result<(), StoreError> {
        let conn = self.raw();
        conn.execute(
            "INSERT INTO worker_tags (uuid, name, description) VALUES (?1, ?2, ?3)",
            params![tag.uuid.to_string(), tag.name.as_str(), tag.description.as_str()],
        )
        .await
        .map_err(StoreError::query)?;
        tag.id = conn.last_insert_rowid();
        info!(tag = %tag.uuid, name = %tag.name, "Worker tag created");
        Ok(())
    }

    pub async fn fetch_worker_tag(&self, uuid: Uuid) -> Result<Option<WorkerTag>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {TAG_COLUMNS} FROM worker_tags WHERE uuid = ?1"),
                params![uuid.to_string()],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(collect_tags(rows).await?.into_iter().next())
    }

    pub async fn fetch_worker_tag_by_name(&self, name: &str) -> Result<Option<WorkerTag>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!("SELECT {TAG_COLUMNS} FROM worker_tags WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(collect_tags(rows).await?.into_iter().next())
    }

    pub async fn fetch_worker_tags(&self) -> Result<Vec<WorkerTag>, StoreError> {
        let rows = self
            .raw()
            .query(&format!("SELECT {TAG_COLUMNS} FROM worker_tags ORDER BY name"), ())
            .await
            .map_err(StoreError::query)?;
        collect_tags(rows).await
    }

    pub async fn has_worker_tags(&self) -> Result<bool, StoreError> {
        let rows = self
            .raw()
            .query("SELECT EXISTS (SELECT 1 FROM worker_tags)", ())
            .await
            .map_err(StoreError::query)?;
        Ok(scalar_i64(rows).await? != 0)
    }

    pub async fn save_worker_tag(&self, tag: &WorkerTag) -> Result<(), StoreError> {
        self.raw()
            .execute(
                "UPDATE worker_tags SET name = ?1, description = ?2 WHERE id = ?3",
                params![tag.name.as_str(), tag.description.as_str(), tag.id],
            )
            .await
            .map_err(StoreError::query)?;
        Ok(())
    }

    /// Delete the tag. Jobs restricted to it lose the restriction through the
    /// foreign key, so the deletion is refused when those are not enforced.
    pub async fn delete_worker_tag(&self, uuid: Uuid) -> Result<bool, StoreError> {
        if !self.foreign_keys_enabled().await? {
            return Err(StoreError::DeletingWithoutForeignKeys);
        }
        let affected = self
            .raw()
            .execute("DELETE FROM worker_tags WHERE uuid = ?1", params![uuid.to_string()])
            .await
            .map_err(StoreError::query)?;
        Ok(affected > 0)
    }

    /// Replace the worker's tag membership with the given tags. Unknown tag
    /// UUIDs are ignored. Either the whole replacement lands or the previous
    /// membership stays, also when called inside a transaction.
    pub async fn set_worker_tags(&self, worker: &Worker, tag_uuids: &[Uuid]) -> Result<(), StoreError> {
        let conn = self.raw();
        conn.execute("SAVEPOINT set_worker_tags", ())
            .await
            .map_err(StoreError::query)?;

        match replace_memberships(conn, worker.id, tag_uuids).await {
            Ok(added) => {
                conn.execute("RELEASE set_worker_tags", ())
                    .await
                    .map_err(|e| StoreError::Commit(e.to_string()))?;
                debug!(worker = %worker.identifier(), tags = added, "Worker tags set");
                Ok(())
            }
            Err(cause) => {
                let undone = match conn.execute("ROLLBACK TO set_worker_tags", ()).await {
                    Ok(_) => conn.execute("RELEASE set_worker_tags", ()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = undone {
                    error!(cause = %cause, error = %e, "Undoing worker tag change failed, lock may be leaked");
                    return Err(StoreError::Rollback {
                        reason: e.to_string(),
                        cause: Some(cause.to_string()),
                    });
                }
                Err(cause)
            }
        }
    }

    pub async fn fetch_tags_of_worker(&self, worker_uuid: Uuid) -> Result<Vec<WorkerTag>, StoreError> {
        let rows = self
            .raw()
            .query(
                &format!(
                    "SELECT {TAG_COLUMNS} FROM worker_tags
                     JOIN worker_tag_membership m ON m.worker_tag_id = worker_tags.id
                     JOIN workers ON workers.id = m.worker_id
                     WHERE workers.uuid = ?1
                     ORDER BY worker_tags.name"
                ),
                params![worker_uuid.to_string()],
            )
            .await
            .map_err(StoreError::query)?;
        collect_tags(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Job;
    use crate::store::tests::test_store;

    #[tokio::test]
    async fn tag_lifecycle() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();
        assert!(!conn.has_worker_tags().await.unwrap());

        let mut tag = WorkerTag::new("gpu", "Workers with a decent GPU");
        conn.create_worker_tag(&mut tag).await.unwrap();
        assert!(conn.has_worker_tags().await.unwrap());
        assert_eq!(
            conn.fetch_worker_tag_by_name("gpu").await.unwrap().map(|t| t.uuid),
            Some(tag.uuid)
        );

        tag.description = "Workers with a big GPU".to_string();
        conn.save_worker_tag(&tag).await.unwrap();
        let fetched = conn.fetch_worker_tag(tag.uuid).await.unwrap().unwrap();
        assert_eq!(fetched.description, "Workers with a big GPU");

        let mut duplicate = WorkerTag::new("gpu", "");
        assert!(matches!(
            conn.create_worker_tag(&mut duplicate).await.unwrap_err(),
            StoreError::Constraint(_)
        ));
    }

    #[tokio::test]
    async fn membership_replace_and_cascade() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();

        let mut gpu = WorkerTag::new("gpu", "");
        let mut cpu = WorkerTag::new("cpu", "");
        conn.create_worker_tag(&mut gpu).await.unwrap();
        conn.create_worker_tag(&mut cpu).await.unwrap();
        let mut worker = Worker::new("w", "10.0.0.1");
        conn.create_worker(&mut worker).await.unwrap();

        conn.set_worker_tags(&worker, &[gpu.uuid, cpu.uuid, Uuid::new_v4()])
            .await
            .unwrap();
        let names: Vec<_> = conn
            .fetch_tags_of_worker(worker.uuid)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["cpu", "gpu"]);

        conn.set_worker_tags(&worker, &[gpu.uuid]).await.unwrap();
        assert_eq!(conn.fetch_tags_of_worker(worker.uuid).await.unwrap().len(), 1);

        assert!(conn.delete_worker_tag(gpu.uuid).await.unwrap());
        assert!(conn.fetch_tags_of_worker(worker.uuid).await.unwrap().is_empty());
        assert_eq!(conn.fetch_worker_tags().await.unwrap().len(), 1);
    }

    async fn tag_names(conn: &Handle<'_>, worker: &Worker) -> Vec<String> {
        conn.fetch_tags_of_worker(worker.uuid)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect()
    }

    #[tokio::test]
    async fn failed_replacement_keeps_previous_tags() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();

        let mut gpu = WorkerTag::new("gpu", "");
        let mut cpu = WorkerTag::new("cpu", "");
        conn.create_worker_tag(&mut gpu).await.unwrap();
        conn.create_worker_tag(&mut cpu).await.unwrap();
        let mut worker = Worker::new("w", "10.0.0.1");
        conn.create_worker(&mut worker).await.unwrap();
        conn.set_worker_tags(&worker, &[gpu.uuid]).await.unwrap();

        // Make the insert fail after the old memberships were deleted.
        conn.raw()
            .execute(
                "CREATE TEMP TRIGGER refuse_membership BEFORE INSERT ON worker_tag_membership
                 BEGIN SELECT RAISE(ABORT, 'membership refused'); END",
                (),
            )
            .await
            .unwrap();
        assert!(conn.set_worker_tags(&worker, &[cpu.uuid]).await.is_err());
        assert!(conn.raw().is_autocommit());
        assert_eq!(tag_names(&conn, &worker).await, vec!["gpu"]);

        conn.raw().execute("DROP TRIGGER refuse_membership", ()).await.unwrap();
        conn.set_worker_tags(&worker, &[cpu.uuid]).await.unwrap();
        assert_eq!(tag_names(&conn, &worker).await, vec!["cpu"]);
    }

    #[tokio::test]
    async fn replacement_inside_transaction_follows_it() {
        let store = test_store().await;
        let mut gpu = WorkerTag::new("gpu", "");
        let mut worker = Worker::new("w", "10.0.0.1");
        {
            let conn = store.conn().await.unwrap();
            conn.create_worker_tag(&mut gpu).await.unwrap();
            conn.create_worker(&mut worker).await.unwrap();
        }

        let tx = store.begin().await.unwrap();
        tx.set_worker_tags(&worker, &[gpu.uuid]).await.unwrap();
        assert!(!tx.raw().is_autocommit());
        tx.rollback().await.unwrap();

        let conn = store.conn().await.unwrap();
        assert!(tag_names(&conn, &worker).await.is_empty());
    }

    #[tokio::test]
    async fn deleting_tag_clears_job_restriction() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();

        let mut tag = WorkerTag::new("render-nodes", "");
        conn.create_worker_tag(&mut tag).await.unwrap();
        let mut job = Job::new("restricted", "test");
        job.worker_tag_id = Some(tag.id);
        conn.create_job(&mut job).await.unwrap();

        conn.delete_worker_tag(tag.uuid).await.unwrap();
        let fetched = conn.fetch_job(job.uuid).await.unwrap().unwrap();
        assert!(fetched.worker_tag_id.is_none());
    }
}
