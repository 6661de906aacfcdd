//! Connection-level SQLite settings.

use std::time::Duration;

use libsql::{Connection, Value};
use tracing::{debug, warn};

use crate::error::OpenError;

/// Run a PRAGMA (or any statement that may return rows) and collect the
/// values of its rows.
///
/// A libsql row is only readable while the cursor sits on it, so values are
/// copied out before advancing.
pub(crate) async fn run(conn: &Connection, sql: &str) -> Result<Vec<Vec<Value>>, libsql::Error> {
    let mut rows = conn.query(sql, ()).await?;
    let columns = rows.column_count();
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        let mut values = Vec::with_capacity(columns.max(0) as usize);
        for idx in 0..columns {
            values.push(row.get_value(idx)?);
        }
        out.push(values);
    }
    Ok(out)
}

/// First column of the first row, if the statement returned any.
async fn first_value(conn: &Connection, sql: &str) -> Result<Option<Value>, libsql::Error> {
    let rows = run(conn, sql).await?;
    Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
}

pub(crate) fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(v) => Some(*v),
        _ => None,
    }
}

pub(crate) fn as_text(value: &Value) -> Option<&str> {
    match value {
        Value::Text(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Configure how long SQLite waits on a locked database file, and read it
/// back to confirm the setting took.
pub(crate) async fn set_busy_timeout(conn: &Connection, timeout: Duration) -> Result<(), OpenError> {
    let millis = timeout.as_millis() as i64;
    let fail = |reason: String| OpenError::BusyTimeout { timeout, reason };

    run(conn, &format!("PRAGMA busy_timeout = {millis}"))
        .await
        .map_err(|e| fail(e.to_string()))?;

    match first_value(conn, "PRAGMA busy_timeout")
        .await
        .map_err(|e| fail(e.to_string()))?
    {
        Some(Value::Integer(actual)) if actual == millis => {
            debug!(busy_timeout_ms = millis, "Busy timeout configured");
            Ok(())
        }
        Some(Value::Integer(actual)) => Err(fail(format!("database reports {actual} ms"))),
        Some(other) => Err(fail(format!("unexpected busy timeout value {other:?}"))),
        None => Err(fail("database did not report a busy timeout".to_string())),
    }
}

/// Whether foreign key constraints are enforced on this connection.
pub(crate) async fn foreign_keys_enabled(conn: &Connection) -> Result<bool, libsql::Error> {
    let value = first_value(conn, "PRAGMA foreign_keys").await?;
    Ok(value.as_ref().and_then(as_i64) == Some(1))
}

/// Turn on foreign key enforcement and verify it took effect.
///
/// SQLite silently ignores the PRAGMA inside an open transaction, which is
/// why the value is read back.
pub(crate) async fn enable_foreign_keys(conn: &Connection) -> Result<(), OpenError> {
    run(conn, "PRAGMA foreign_keys = 1")
        .await
        .map_err(|e| OpenError::ForeignKeys(format!("could not enable foreign keys: {e}")))?;

    let enabled = foreign_keys_enabled(conn)
        .await
        .map_err(|e| OpenError::ForeignKeys(format!("could not read foreign key setting: {e}")))?;
    if !enabled {
        return Err(OpenError::ForeignKeys(
            "foreign keys are disabled after enabling them".to_string(),
        ));
    }
    debug!("Foreign key checks enabled");
    Ok(())
}

/// Enable the write-ahead log with relaxed syncing.
///
/// In-memory databases report `memory` as their journal mode; this is not an
/// error.
pub(crate) async fn set_journal_mode(conn: &Connection) -> Result<(), libsql::Error> {
    let mode = first_value(conn, "PRAGMA journal_mode = WAL")
        .await?
        .as_ref()
        .and_then(as_text)
        .map(str::to_string)
        .unwrap_or_default();
    if !mode.eq_ignore_ascii_case("wal") {
        warn!(journal_mode = %mode, "Write-ahead log not in use");
    }

    run(conn, "PRAGMA synchronous = NORMAL").await?;
    Ok(())
}
