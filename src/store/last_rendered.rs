//! The singleton "last rendered" record.

use chrono::Utc;
use libsql::params;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Handle;
use crate::store::convert::{parse_uuid, timestamp};

impl Handle<'_> {
    /// Point the last-rendered record at the job, replacing whatever it
    /// pointed at before.
    pub async fn set_last_rendered(&self, job_uuid: Uuid) -> Result<(), StoreError> {
        let affected = self
            .raw()
            .execute(
                "INSERT INTO last_rendereds (id, job_id, updated_at)
                 SELECT 1, id, ?2 FROM jobs WHERE uuid = ?1
                 ON CONFLICT (id) DO UPDATE SET job_id = excluded.job_id, updated_at = excluded.updated_at",
                params![job_uuid.to_string(), timestamp(&Utc::now())],
            )
            .await
            .map_err(StoreError::query)?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "job",
                id: job_uuid.to_string(),
            });
        }
        debug!(job = %job_uuid, "Last-rendered job updated");
        Ok(())
    }

    /// UUID of the job rendered last, or `None` when nothing was rendered yet.
    pub async fn get_last_rendered_job_uuid(&self) -> Result<Option<Uuid>, StoreError> {
        let mut rows = self
            .raw()
            .query(
                "SELECT jobs.uuid FROM last_rendereds JOIN jobs ON jobs.id = last_rendereds.job_id
                 WHERE last_rendereds.id = 1",
                (),
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Job;
    use crate::store::convert::scalar_i64;
    use crate::store::tests::test_store;

    #[tokio::test]
    async fn empty_store_has_no_last_rendered() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();
        assert_eq!(conn.get_last_rendered_job_uuid().await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_replaces_previous_job() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();

        let mut j1 = Job::new("one", "test");
        let mut j2 = Job::new("two", "test");
        conn.create_job(&mut j1).await.unwrap();
        conn.create_job(&mut j2).await.unwrap();

        conn.set_last_rendered(j1.uuid).await.unwrap();
        assert_eq!(conn.get_last_rendered_job_uuid().await.unwrap(), Some(j1.uuid));

        conn.set_last_rendered(j2.uuid).await.unwrap();
        assert_eq!(conn.get_last_rendered_job_uuid().await.unwrap(), Some(j2.uuid));

        let rows = conn
            .raw()
            .query("SELECT COUNT(*) FROM last_rendereds", ())
            .await
            .unwrap();
        assert_eq!(scalar_i64(rows).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();
        let err = conn.set_last_rendered(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "job", .. }));
    }

    #[tokio::test]
    async fn second_row_is_rejected_by_schema() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();
        let mut job = Job::new("one", "test");
        conn.create_job(&mut job).await.unwrap();

        let result = conn
            .raw()
            .execute(
                "INSERT INTO last_rendereds (id, job_id, updated_at) VALUES (2, ?1, 'now')",
                params![job.id],
            )
            .await;
        assert!(result.is_err());
    }
}
