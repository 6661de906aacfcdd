//! Conversions between domain values and SQLite column values.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::StoreError;

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, used by column defaults
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

pub(crate) fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("invalid UUID {s:?}: {e}")))
}

/// Canonical timestamp format written to the database. Fixed width, so
/// timestamps compare correctly as text.
pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Convert `Option<&DateTime>` to libsql Value.
pub(crate) fn opt_timestamp(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(timestamp(dt)),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
pub(crate) fn opt_integer(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Comma-separated list column, as used for a worker's supported task types.
pub(crate) fn join_list(items: &[String]) -> String {
    items.join(",")
}

pub(crate) fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// `?, ?, ?` placeholder list for an `IN (...)` clause of `n` values.
pub(crate) fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read a single `COUNT(*)`-style integer from the first row.
pub(crate) async fn scalar_i64(mut rows: libsql::Rows) -> Result<i64, StoreError> {
    match rows.next().await.map_err(StoreError::query)? {
        Some(row) => row.get::<i64>(0).map_err(StoreError::query),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_sqlite_formats() {
        let a = parse_datetime("2024-03-01T12:30:00+00:00");
        let b = parse_datetime("2024-03-01 12:30:00");
        assert_eq!(a, b);
        assert_eq!(parse_datetime("not a date"), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let whole = parse_datetime("2024-03-01T12:30:00Z");
        let fraction = parse_datetime("2024-03-01T12:30:00.5Z");
        assert_eq!(timestamp(&whole).len(), timestamp(&fraction).len());
        assert!(timestamp(&whole) < timestamp(&fraction));
        assert_eq!(parse_datetime(&timestamp(&fraction)), fraction);
    }

    #[test]
    fn list_column_ignores_empty_entries() {
        let items = split_list("blender, ffmpeg,,file-management");
        assert_eq!(items, vec!["blender", "ffmpeg", "file-management"]);
        assert_eq!(join_list(&items), "blender,ffmpeg,file-management");
        assert!(split_list("").is_empty());
    }

    #[test]
    fn placeholder_numbering_starts_at_offset() {
        assert_eq!(placeholders(2, 3), "?2, ?3, ?4");
    }
}
