//! Version-tracked schema migrations.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks the
//! current version and applies only the new ones, each in its own transaction
//! together with its `_migrations` record. Foreign keys are switched off while
//! migrating, since table rebuilds temporarily break references; the caller
//! re-enables and verifies them afterwards.

use libsql::Connection;
use tracing::info;

use crate::error::{OpenError, StoreError};
use crate::store::convert::scalar_i64;
use crate::store::pragma;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Name of the trigger guarding `jobs.delete_requested_at`.
pub(crate) const DELETE_MARKER_TRIGGER: &str = "jobs_delete_requested_at_never_cleared";

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS worker_tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                job_type TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 50,
                status TEXT NOT NULL,
                activity TEXT NOT NULL DEFAULT '',
                settings TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                delete_requested_at TEXT,
                storage_checkout_id TEXT NOT NULL DEFAULT '',
                worker_tag_id INTEGER REFERENCES worker_tags(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_delete_requested_at ON jobs(delete_requested_at);

            CREATE TABLE IF NOT EXISTS workers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                address TEXT NOT NULL DEFAULT '',
                platform TEXT NOT NULL DEFAULT '',
                software TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                last_seen_at TEXT,
                supported_task_types TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS worker_tag_membership (
                worker_tag_id INTEGER NOT NULL REFERENCES worker_tags(id) ON DELETE CASCADE,
                worker_id INTEGER NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
                PRIMARY KEY (worker_tag_id, worker_id)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                task_type TEXT NOT NULL,
                job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                priority INTEGER NOT NULL DEFAULT 50,
                status TEXT NOT NULL,
                worker_id INTEGER REFERENCES workers(id) ON DELETE SET NULL,
                activity TEXT NOT NULL DEFAULT '',
                commands TEXT NOT NULL DEFAULT '[]',
                last_touched_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS task_failures (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                worker_id INTEGER NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (task_id, worker_id)
            );

            CREATE TABLE IF NOT EXISTS last_rendereds (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TRIGGER IF NOT EXISTS jobs_delete_requested_at_never_cleared
            BEFORE UPDATE OF delete_requested_at ON jobs
            WHEN OLD.delete_requested_at IS NOT NULL AND NEW.delete_requested_at IS NULL
            BEGIN
                SELECT RAISE(ABORT, 'delete_requested_at cannot be cleared once set');
            END;
        "#,
    },
    Migration {
        version: 2,
        name: "job_blocklist",
        sql: r#"
            CREATE TABLE IF NOT EXISTS job_blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                worker_id INTEGER NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
                task_type TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (job_id, worker_id, task_type)
            );
            CREATE INDEX IF NOT EXISTS idx_job_blocks_job ON job_blocks(job_id);
        "#,
    },
    Migration {
        version: 3,
        name: "worker_last_seen_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_workers_last_seen_at ON workers(last_seen_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_last_touched_at ON tasks(last_touched_at);
        "#,
    },
];

/// The schema version a fully migrated database is at.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply all pending migrations.
pub(crate) async fn run_migrations(conn: &Connection) -> Result<(), OpenError> {
    run_migrations_to(conn, latest_version()).await
}

/// Apply pending migrations up to and including `target`.
pub(crate) async fn run_migrations_to(conn: &Connection, target: i64) -> Result<(), OpenError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| OpenError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let from_version = current_version(conn)
        .await
        .map_err(|e| OpenError::Migration(e.to_string()))?;

    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| m.version > from_version && m.version <= target)
        .collect();
    if pending.is_empty() {
        info!(version = from_version, "Database schema is up to date");
        return Ok(());
    }

    // Cannot be changed inside a transaction, so this happens up front.
    pragma::run(conn, "PRAGMA foreign_keys = 0")
        .await
        .map_err(|e| OpenError::Migration(format!("Failed to disable foreign keys: {e}")))?;

    for migration in pending {
        info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await?;
    }

    let version = current_version(conn)
        .await
        .map_err(|e| OpenError::Migration(e.to_string()))?;
    info!("Database migrations complete (at V{version})");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), OpenError> {
    let fail = |stage: &str, e: libsql::Error| {
        OpenError::Migration(format!(
            "Migration V{} ({}) {stage}: {e}",
            migration.version, migration.name
        ))
    };

    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| fail("could not start", e))?;

    let result = async {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| fail("failed", e))?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| fail("could not be recorded", e))?;
        Ok::<(), OpenError>(())
    }
    .await;

    match result {
        Ok(()) => {
            conn.execute("COMMIT", ())
                .await
                .map_err(|e| fail("could not be committed", e))?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = conn.execute("ROLLBACK", ()).await {
                tracing::error!(
                    version = migration.version,
                    error = %rollback_err,
                    "Rollback of failed migration also failed"
                );
            }
            Err(err)
        }
    }
}

/// Get the highest applied migration version, or 0 if none (or if the
/// database was never migrated at all).
pub async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_migrations'",
            (),
        )
        .await
        .map_err(StoreError::query)?;
    if scalar_i64(rows).await? == 0 {
        return Ok(0);
    }

    let rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(StoreError::query)?;
    scalar_i64(rows).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        scalar_i64(rows).await.unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "jobs",
            "tasks",
            "workers",
            "worker_tags",
            "worker_tag_membership",
            "task_failures",
            "last_rendereds",
            "job_blocks",
        ] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = current_version(&conn).await.unwrap();
        assert_eq!(version, latest_version());
    }

    #[tokio::test]
    async fn partial_migration_stops_at_target() {
        let conn = test_conn().await;
        run_migrations_to(&conn, 1).await.unwrap();

        assert_eq!(current_version(&conn).await.unwrap(), 1);
        assert!(table_exists(&conn, "jobs").await);
        assert!(!table_exists(&conn, "job_blocks").await);

        run_migrations(&conn).await.unwrap();
        assert!(table_exists(&conn, "job_blocks").await);
    }

    #[tokio::test]
    async fn fresh_database_is_at_version_zero() {
        let conn = test_conn().await;
        assert_eq!(current_version(&conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deletion_marker_cannot_be_cleared() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO jobs (uuid, name, job_type, status, delete_requested_at)
             VALUES ('j1', 'job', 'test', 'queued', '2024-01-01T00:00:00+00:00')",
            (),
        )
        .await
        .unwrap();

        let result = conn
            .execute("UPDATE jobs SET delete_requested_at = NULL WHERE uuid = 'j1'", ())
            .await;
        assert!(result.is_err());

        // Moving the marker forward is allowed.
        conn.execute(
            "UPDATE jobs SET delete_requested_at = '2024-02-01T00:00:00+00:00' WHERE uuid = 'j1'",
            (),
        )
        .await
        .unwrap();
    }
}
