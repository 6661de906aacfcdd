//! Write-ahead log checkpointing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, Interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::store::integrity::next_tick;
use crate::store::{Store, pragma};

/// Result of `PRAGMA wal_checkpoint(FULL)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalCheckpoint {
    /// The checkpoint could not complete because another connection held a
    /// lock.
    pub busy: bool,
    /// Pages in the write-ahead log; -1 without a log (e.g. in-memory).
    pub log_pages: i64,
    /// Pages moved back into the database file.
    pub checkpointed_pages: i64,
}

impl Store {
    /// Move the write-ahead log back into the database file.
    pub async fn wal_checkpoint(&self) -> Result<WalCheckpoint, StoreError> {
        let handle = self.conn().await?;
        let rows = pragma::run(handle.raw(), "PRAGMA wal_checkpoint(FULL)")
            .await
            .map_err(StoreError::query)?;
        let Some(row) = rows.first() else {
            return Ok(WalCheckpoint::default());
        };
        let column = |idx: usize| {
            row.get(idx).and_then(pragma::as_i64).ok_or_else(|| {
                StoreError::Query(format!("unexpected wal_checkpoint result {row:?}"))
            })
        };
        let result = WalCheckpoint {
            busy: column(0)? != 0,
            log_pages: column(1)?,
            checkpointed_pages: column(2)?,
        };
        debug!(?result, "Write-ahead log checkpointed");
        Ok(result)
    }
}

/// Checkpoint periodically until cancelled. While checkpoints come back busy
/// the fast period is used, to catch up with a busy database. A zero period
/// means no periodic checkpoints on that schedule.
pub async fn run_wal_checkpoint_loop(store: Arc<Store>, cancel: CancellationToken) {
    let slow = store.config().wal_checkpoint_period;
    let fast = store.config().wal_checkpoint_period_fast;

    let mut last = match store.wal_checkpoint().await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Could not checkpoint write-ahead log at startup");
            WalCheckpoint::default()
        }
    };
    info!(period_secs = slow.as_secs(), "Periodic write-ahead log checkpoint started");

    let mut period = slow;
    let mut ticker = schedule(period);
    loop {
        let wanted: Duration = if last.busy { fast } else { slow };
        if wanted != period {
            info!(
                busy = last.busy,
                log_pages = last.log_pages,
                checkpointed_pages = last.checkpointed_pages,
                period_secs = wanted.as_secs(),
                "Switching write-ahead log checkpoint schedule"
            );
            period = wanted;
            ticker = schedule(period);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = next_tick(&mut ticker) => {}
        }

        match store.wal_checkpoint().await {
            Ok(result) => last = result,
            Err(e) => {
                error!(error = %e, "Could not checkpoint write-ahead log, the database may be very busy");
                last = WalCheckpoint::default();
            }
        }
    }

    info!("Periodic write-ahead log checkpoint stopped");
}

fn schedule(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        warn!("Write-ahead log checkpoint period is zero, not checkpointing periodically");
        return None;
    }
    Some(interval_at(Instant::now() + period, period))
}
