//! Database integrity checks and the background re-verification loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use libsql::{Connection, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::store::Store;
use crate::store::convert::scalar_i64;
use crate::store::migrations::{self, DELETE_MARKER_TRIGGER};
use crate::store::pragma;

/// Outcome of an integrity check. An empty problem list means the database
/// passed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub problems: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

impl std::fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ok() {
            f.write_str("ok")
        } else {
            f.write_str(&self.problems.join("; "))
        }
    }
}

/// Invariants on the domain tables, each a query counting violations.
const INVARIANTS: &[(&str, &str)] = &[
    (
        "tasks without a job",
        "SELECT COUNT(*) FROM tasks WHERE job_id NOT IN (SELECT id FROM jobs)",
    ),
    (
        "tasks assigned to a missing worker",
        "SELECT COUNT(*) FROM tasks
         WHERE worker_id IS NOT NULL AND worker_id NOT IN (SELECT id FROM workers)",
    ),
    (
        "more than one last-rendered record",
        "SELECT MAX(COUNT(*) - 1, 0) FROM last_rendereds",
    ),
    (
        "last-rendered record pointing to a missing job",
        "SELECT COUNT(*) FROM last_rendereds WHERE job_id NOT IN (SELECT id FROM jobs)",
    ),
    (
        "task failures of a missing task",
        "SELECT COUNT(*) FROM task_failures WHERE task_id NOT IN (SELECT id FROM tasks)",
    ),
    (
        "task failures of a missing worker",
        "SELECT COUNT(*) FROM task_failures WHERE worker_id NOT IN (SELECT id FROM workers)",
    ),
];

/// Run all integrity checks on the given connection.
///
/// Foreign key enforcement is switched back on first when something turned it
/// off. Domain invariants are only checked on a migrated schema.
pub(crate) async fn check(conn: &Connection) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();

    let fk_enabled = pragma::foreign_keys_enabled(conn)
        .await
        .map_err(StoreError::query)?;
    if !fk_enabled {
        warn!("Foreign key checks were disabled, re-enabling them");
        pragma::enable_foreign_keys(conn)
            .await
            .map_err(|e| StoreError::Integrity(e.to_string()))?;
    }

    check_structure(conn, &mut report).await?;
    check_foreign_keys(conn, &mut report).await?;

    if migrations::current_version(conn).await? >= 1 {
        check_invariants(conn, &mut report).await?;
    }

    if report.is_ok() {
        debug!("Database integrity check passed");
    }
    Ok(report)
}

async fn check_structure(conn: &Connection, report: &mut IntegrityReport) -> Result<(), StoreError> {
    let rows = pragma::run(conn, "PRAGMA integrity_check")
        .await
        .map_err(StoreError::query)?;
    report.problems.extend(structure_problems(&rows)?);
    Ok(())
}

/// Interpret the rows of `PRAGMA integrity_check`: a single "ok" row means
/// the database is sound, anything else is a list of problems.
fn structure_problems(rows: &[Vec<Value>]) -> Result<Vec<String>, StoreError> {
    let messages = rows
        .iter()
        .map(|row| {
            row.first()
                .and_then(pragma::as_text)
                .map(str::to_string)
                .ok_or_else(|| {
                    StoreError::Integrity(format!("unreadable integrity check row {row:?}"))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    match messages.as_slice() {
        [] => Err(StoreError::Integrity(
            "integrity check returned no rows".to_string(),
        )),
        [only] if only == "ok" => Ok(Vec::new()),
        _ => Ok(messages
            .into_iter()
            .map(|msg| format!("integrity check: {msg}"))
            .collect()),
    }
}

async fn check_foreign_keys(
    conn: &Connection,
    report: &mut IntegrityReport,
) -> Result<(), StoreError> {
    let rows = pragma::run(conn, "PRAGMA foreign_key_check")
        .await
        .map_err(StoreError::query)?;
    for row in rows {
        let text = |idx: usize| row.get(idx).and_then(pragma::as_text).unwrap_or("?");
        let rowid = row
            .get(1)
            .and_then(pragma::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        report.problems.push(format!(
            "foreign key violation: {} row {rowid} references a missing {} row",
            text(0),
            text(2)
        ));
    }
    Ok(())
}

async fn check_invariants(conn: &Connection, report: &mut IntegrityReport) -> Result<(), StoreError> {
    for (description, sql) in INVARIANTS {
        let rows = conn.query(sql, ()).await.map_err(StoreError::query)?;
        let count = scalar_i64(rows).await?;
        if count > 0 {
            report.problems.push(format!("{description} ({count})"));
        }
    }

    let rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
            libsql::params![DELETE_MARKER_TRIGGER],
        )
        .await
        .map_err(StoreError::query)?;
    if scalar_i64(rows).await? == 0 {
        report
            .problems
            .push(format!("trigger {DELETE_MARKER_TRIGGER} is missing"));
    }
    Ok(())
}

/// Callback invoked when a background check fails.
pub type IntegrityErrorHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Background loop re-verifying database integrity.
///
/// Requests are coalesced: while one check is pending, further requests are
/// absorbed.
pub struct IntegrityMonitor {
    requests: mpsc::Sender<()>,
    checks_completed: Arc<AtomicU64>,
    checks_failed: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl IntegrityMonitor {
    /// Start the loop. A zero `period` disables periodic checks; explicit
    /// requests are still served. A failed check is passed to `on_error` and
    /// the loop keeps running.
    pub fn spawn(
        store: Arc<Store>,
        period: Duration,
        cancel: CancellationToken,
        on_error: IntegrityErrorHandler,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let checks_completed = Arc::new(AtomicU64::new(0));
        let checks_failed = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run_loop(
            store,
            period,
            rx,
            cancel,
            on_error,
            checks_completed.clone(),
            checks_failed.clone(),
        ));
        Self {
            requests: tx,
            checks_completed,
            checks_failed,
            handle,
        }
    }

    /// Ask for a check soon. Never blocks.
    pub fn request_check(&self) {
        match self.requests.try_send(()) {
            Ok(()) => debug!("Integrity check requested"),
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("Integrity check already pending, request absorbed")
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("Integrity monitor stopped, ignoring check request")
            }
        }
    }

    /// Number of checks run so far, passed or failed.
    pub fn checks_completed(&self) -> u64 {
        self.checks_completed.load(Ordering::SeqCst)
    }

    /// Number of checks that found a problem or could not run.
    pub fn checks_failed(&self) -> u64 {
        self.checks_failed.load(Ordering::SeqCst)
    }

    /// Wait for the loop to end after its cancellation token fired.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Integrity monitor task panicked");
        }
    }
}

async fn run_loop(
    store: Arc<Store>,
    period: Duration,
    mut requests: mpsc::Receiver<()>,
    cancel: CancellationToken,
    on_error: IntegrityErrorHandler,
    checks_completed: Arc<AtomicU64>,
    checks_failed: Arc<AtomicU64>,
) {
    let mut ticker =
        (!period.is_zero()).then(|| tokio::time::interval_at(Instant::now() + period, period));
    info!(period_secs = period.as_secs(), "Integrity monitor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
            }
            _ = next_tick(&mut ticker) => {}
        }

        let failure = match store.check_integrity().await {
            Ok(report) if report.is_ok() => None,
            Ok(report) => {
                let err = StoreError::Integrity(report.to_string());
                error!(error = %err, "Background integrity check failed");
                Some(err)
            }
            Err(err) => {
                error!(error = %err, "Could not run background integrity check");
                Some(err)
            }
        };
        if let Some(err) = failure {
            checks_failed.fetch_add(1, Ordering::SeqCst);
            on_error(&err);
        }
        checks_completed.fetch_add(1, Ordering::SeqCst);
    }

    info!("Integrity monitor stopped");
}

/// Wait for the next tick, or forever without a ticker.
pub(super) async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::StoreConfig;

    async fn test_store() -> Arc<Store> {
        Arc::new(Store::open_in_memory(StoreConfig::default()).await.unwrap())
    }

    async fn wait_for_checks(monitor: &IntegrityMonitor, n: u64) {
        for _ in 0..100 {
            if monitor.checks_completed() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("monitor did not reach {n} checks");
    }

    fn recording_handler() -> (IntegrityErrorHandler, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let handler: IntegrityErrorHandler = Arc::new(move |e: &StoreError| {
            sink.lock().unwrap().push(e.to_string());
        });
        (handler, errors)
    }

    #[tokio::test]
    async fn clean_database_passes() {
        let store = test_store().await;
        let report = store.check_integrity().await.unwrap();
        assert!(report.is_ok(), "{report}");
        assert_eq!(report.to_string(), "ok");
    }

    #[tokio::test]
    async fn orphaned_task_is_reported() {
        let store = test_store().await;
        {
            let conn = store.conn().await.unwrap();
            pragma::run(conn.raw(), "PRAGMA foreign_keys = 0").await.unwrap();
            conn.raw()
                .execute(
                    "INSERT INTO tasks (uuid, name, task_type, job_id, status)
                     VALUES ('t1', 'orphan', 'blender', 999, 'queued')",
                    (),
                )
                .await
                .unwrap();
        }

        let report = store.check_integrity().await.unwrap();
        assert!(!report.is_ok());
        assert!(report.problems.iter().any(|p| p.contains("tasks without a job")));
        assert!(
            report
                .problems
                .iter()
                .any(|p| p.starts_with("foreign key violation: tasks row")),
            "{report}"
        );

        // The check switched enforcement back on.
        let conn = store.conn().await.unwrap();
        assert!(pragma::foreign_keys_enabled(conn.raw()).await.unwrap());
    }

    #[test]
    fn structure_rows_are_interpreted() {
        let ok = vec![vec![Value::Text("ok".into())]];
        assert!(structure_problems(&ok).unwrap().is_empty());

        let broken = vec![
            vec![Value::Text("row 3 missing from index idx_tasks_job".into())],
            vec![Value::Text("wrong # of entries in index idx_tasks_job".into())],
        ];
        let problems = structure_problems(&broken).unwrap();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("row 3 missing"));

        let err = structure_problems(&[vec![Value::Null]]).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)), "got {err:?}");
        assert!(structure_problems(&[]).is_err());
    }

    #[tokio::test]
    async fn structure_check_reads_ok_from_database() {
        let store = test_store().await;
        let conn = store.conn().await.unwrap();
        let mut report = IntegrityReport::default();
        check_structure(conn.raw(), &mut report).await.unwrap();
        assert!(report.is_ok(), "{report}");
    }

    #[tokio::test]
    async fn missing_trigger_is_reported() {
        let store = test_store().await;
        {
            let conn = store.conn().await.unwrap();
            conn.raw()
                .execute(&format!("DROP TRIGGER {DELETE_MARKER_TRIGGER}"), ())
                .await
                .unwrap();
        }
        let report = store.check_integrity().await.unwrap();
        assert!(report.problems.iter().any(|p| p.contains(DELETE_MARKER_TRIGGER)));
    }

    #[tokio::test]
    async fn requests_are_coalesced() {
        let store = test_store().await;
        let cancel = CancellationToken::new();
        let (handler, errors) = recording_handler();
        let monitor = IntegrityMonitor::spawn(store, Duration::ZERO, cancel.clone(), handler);

        // The loop has not run yet on this single-threaded runtime, so the
        // second request finds the slot taken.
        monitor.request_check();
        monitor.request_check();

        wait_for_checks(&monitor, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.checks_completed(), 1);
        assert!(errors.lock().unwrap().is_empty());

        monitor.request_check();
        wait_for_checks(&monitor, 2).await;
        assert_eq!(monitor.checks_failed(), 0);

        cancel.cancel();
        monitor.join().await;
    }

    #[tokio::test]
    async fn failures_reach_the_handler() {
        let store = test_store().await;
        {
            let conn = store.conn().await.unwrap();
            conn.raw()
                .execute(&format!("DROP TRIGGER {DELETE_MARKER_TRIGGER}"), ())
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let (handler, errors) = recording_handler();
        let monitor = IntegrityMonitor::spawn(store, Duration::ZERO, cancel.clone(), handler);
        monitor.request_check();
        wait_for_checks(&monitor, 1).await;

        assert_eq!(monitor.checks_failed(), 1);
        assert!(errors.lock().unwrap()[0].contains("trigger"));

        // A failure does not stop the loop.
        monitor.request_check();
        wait_for_checks(&monitor, 2).await;
        assert_eq!(monitor.checks_failed(), 2);
        assert_eq!(errors.lock().unwrap().len(), 2);

        cancel.cancel();
        monitor.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_checks_run_without_requests() {
        let store = test_store().await;
        let cancel = CancellationToken::new();
        let (handler, _errors) = recording_handler();
        let monitor =
            IntegrityMonitor::spawn(store, Duration::from_secs(60), cancel.clone(), handler);

        tokio::time::sleep(Duration::from_secs(61)).await;
        wait_for_checks(&monitor, 1).await;

        cancel.cancel();
        monitor.join().await;
    }
}
