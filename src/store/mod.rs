//! Persistence layer: SQLite via libSQL.
//!
//! The store owns exactly one connection. Callers reach it either through an
//! autocommit [`Handle`] from [`Store::conn`] or a [`Transaction`] from
//! [`Store::begin`]; both hold the connection until dropped, so competing
//! callers queue instead of racing for SQLite's write lock.

mod convert;
pub mod integrity;
mod job_blocks;
mod jobs;
mod last_rendered;
mod maintenance;
pub mod migrations;
mod pragma;
mod task_failures;
mod tasks;
mod workers;
mod worker_tags;

use std::ops::Deref;
use std::path::Path;

use libsql::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::{OpenError, StoreError};

pub use integrity::{IntegrityMonitor, IntegrityReport};
pub use jobs::JobStatusCount;
pub use maintenance::{WalCheckpoint, run_wal_checkpoint_loop};
pub use workers::WorkerStatusCount;

/// The manager's database.
pub struct Store {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl Store {
    /// Open (or create) a database file, check it, and migrate it to the
    /// latest schema.
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let label = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| OpenError::Connect {
                path: label.clone(),
                reason: format!("failed to create database directory: {e}"),
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| OpenError::Connect {
                path: label.clone(),
                reason: e.to_string(),
            })?;
        let store = Self::from_database(db, &label, config).await?;
        info!(path = %label, "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_in_memory(config: StoreConfig) -> Result<Self, OpenError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| OpenError::Connect {
                path: ":memory:".to_string(),
                reason: e.to_string(),
            })?;
        Self::from_database(db, ":memory:", config).await
    }

    async fn from_database(
        db: libsql::Database,
        label: &str,
        config: StoreConfig,
    ) -> Result<Self, OpenError> {
        let conn = db.connect().map_err(|e| OpenError::Connect {
            path: label.to_string(),
            reason: format!("failed to create connection: {e}"),
        })?;
        Self::from_connection(db, conn, label, config).await
    }

    /// Run the startup sequence on `conn` and wrap it. Nothing is migrated
    /// unless every earlier step passed.
    async fn from_connection(
        db: libsql::Database,
        conn: Connection,
        label: &str,
        config: StoreConfig,
    ) -> Result<Self, OpenError> {
        pragma::set_busy_timeout(&conn, config.busy_timeout).await?;
        pragma::enable_foreign_keys(&conn).await?;
        pragma::set_journal_mode(&conn)
            .await
            .map_err(|e| OpenError::Connect {
                path: label.to_string(),
                reason: format!("failed to configure journal: {e}"),
            })?;

        verify_integrity(&conn, "before migration").await?;
        vacuum(&conn).await;

        migrations::run_migrations(&conn).await?;
        pragma::enable_foreign_keys(&conn).await?;

        verify_integrity(&conn, "after migration").await?;
        vacuum(&conn).await;

        Ok(Self {
            db,
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Acquire the connection for autocommit queries.
    pub async fn conn(&self) -> Result<Handle<'_>, StoreError> {
        let guard = tokio::time::timeout(self.config.busy_timeout, self.conn.lock())
            .await
            .map_err(|_| StoreError::Busy(self.config.busy_timeout))?;

        if !guard.is_autocommit() {
            warn!("Connection still had an open transaction, rolling it back");
            if let Err(e) = guard.execute("ROLLBACK", ()).await {
                error!(error = %e, "Rollback of abandoned transaction failed, lock may be leaked");
                return Err(StoreError::Rollback {
                    reason: e.to_string(),
                    cause: Some("transaction dropped without commit or rollback".to_string()),
                });
            }
        }

        Ok(Handle { conn: guard })
    }

    /// Start a write transaction. The connection stays reserved until the
    /// transaction is committed, rolled back, or dropped.
    pub async fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        let handle = self.conn().await?;
        handle
            .conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(StoreError::query)?;
        debug!("Transaction started");
        Ok(Transaction { handle })
    }

    /// Run the integrity checks through the shared connection.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, StoreError> {
        let handle = self.conn().await?;
        integrity::check(&handle.conn).await
    }

    /// Current schema version.
    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let handle = self.conn().await?;
        migrations::current_version(&handle.conn).await
    }
}

async fn verify_integrity(conn: &Connection, stage: &str) -> Result<(), OpenError> {
    let report = integrity::check(conn)
        .await
        .map_err(|e| OpenError::Integrity(format!("{stage}: {e}")))?;
    if !report.is_ok() {
        error!(stage, problems = %report, "Database integrity check failed");
        return Err(OpenError::Integrity(format!("{stage}: {report}")));
    }
    Ok(())
}

/// Reclaim free pages. Failure only costs disk space.
async fn vacuum(conn: &Connection) {
    match conn.execute("VACUUM", ()).await {
        Ok(_) => debug!("Database vacuumed"),
        Err(e) => warn!(error = %e, "Error vacuuming database"),
    }
}

/// Exclusive access to the connection, in autocommit mode.
///
/// All entity queries are methods on this type, and so are available on a
/// [`Transaction`] as well.
pub struct Handle<'a> {
    conn: MutexGuard<'a, Connection>,
}

impl Handle<'_> {
    pub(crate) fn raw(&self) -> &Connection {
        &self.conn
    }

    /// Whether foreign key constraints are enforced right now.
    pub async fn foreign_keys_enabled(&self) -> Result<bool, StoreError> {
        pragma::foreign_keys_enabled(&self.conn)
            .await
            .map_err(StoreError::query)
    }
}

/// An explicit write transaction.
pub struct Transaction<'a> {
    handle: Handle<'a>,
}

impl<'a> Deref for Transaction<'a> {
    type Target = Handle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Transaction<'_> {
    pub async fn commit(self) -> Result<(), StoreError> {
        let conn = &self.handle.conn;
        let Err(commit_err) = conn.execute("COMMIT", ()).await else {
            debug!("Transaction committed");
            return Ok(());
        };

        // A failed COMMIT may leave the transaction open.
        if conn.is_autocommit() {
            return Err(StoreError::Commit(commit_err.to_string()));
        }
        match conn.execute("ROLLBACK", ()).await {
            Ok(_) => Err(StoreError::Commit(commit_err.to_string())),
            Err(rollback_err) => {
                error!(
                    commit_error = %commit_err,
                    rollback_error = %rollback_err,
                    "Rollback after failed commit also failed, lock may be leaked"
                );
                Err(StoreError::Rollback {
                    reason: rollback_err.to_string(),
                    cause: Some(commit_err.to_string()),
                })
            }
        }
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        match self.handle.conn.execute("ROLLBACK", ()).await {
            Ok(_) => {
                debug!("Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Transaction rollback failed, lock may be leaked");
                Err(StoreError::Rollback {
                    reason: e.to_string(),
                    cause: None,
                })
            }
        }
    }

    /// Roll back because of `cause`, returning the error to propagate: the
    /// cause itself, or a rollback error carrying it when the rollback fails
    /// too.
    pub async fn rollback_after(self, cause: StoreError) -> StoreError {
        match self.handle.conn.execute("ROLLBACK", ()).await {
            Ok(_) => {
                debug!(cause = %cause, "Transaction rolled back after error");
                cause
            }
            Err(e) => {
                error!(
                    cause = %cause,
                    error = %e,
                    "Rollback after error failed, lock may be leaked"
                );
                StoreError::Rollback {
                    reason: e.to_string(),
                    cause: Some(cause.to_string()),
                }
            }
        }
    }
}
