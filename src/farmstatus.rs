//! Farm-wide status indicator, derived from the worker and job summaries.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::eventbus::{EventBus, FarmStatus, FarmStatusReport};
use crate::model::{JobStatus, WorkerStatus};
use crate::store::{JobStatusCount, Store, WorkerStatusCount};

/// Polls the store and broadcasts the farm status whenever it changes.
pub struct FarmStatusService {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    poll_wait: Duration,
    last_report: Mutex<FarmStatusReport>,
}

impl FarmStatusService {
    /// `poll_wait` is the pause between the end of one poll and the start of
    /// the next.
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, poll_wait: Duration) -> Self {
        Self {
            store,
            bus,
            poll_wait,
            last_report: Mutex::new(FarmStatusReport {
                status: FarmStatus::Starting,
            }),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        debug!("Farm status polling service running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_wait) => {}
            }
            self.poll().await;
        }
        debug!("Farm status polling service stopped");
    }

    /// Last known report.
    pub fn report(&self) -> FarmStatusReport {
        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check the farm once, broadcasting when the report changed. Returns
    /// whether it changed.
    pub async fn poll(&self) -> bool {
        let Some(report) = self.check_farm_status().await else {
            // Already logged; the last report stays available.
            return false;
        };

        let changed = {
            let mut last = self.last_report.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *last != report;
            *last = report;
            changed
        };
        if changed {
            self.bus.broadcast_farm_status(report);
        }
        changed
    }

    async fn check_farm_status(&self) -> Option<FarmStatusReport> {
        trace!("Checking the farm status");
        let start = Instant::now();

        let summaries = async {
            let conn = self.store.conn().await?;
            let workers = conn.summarize_worker_statuses().await?;
            // Without operational workers the job statuses do not matter.
            if is_inoperative(&workers) {
                return Ok::<_, StoreError>((workers, Vec::new()));
            }
            let jobs = conn.summarize_job_statuses().await?;
            Ok((workers, jobs))
        }
        .await;

        debug!(duration_ms = start.elapsed().as_millis() as u64, "Checked the farm status");
        match summaries {
            Ok((workers, jobs)) => Some(FarmStatusReport {
                status: derive_status(&workers, &jobs),
            }),
            Err(e) if e.is_busy() => {
                warn!("Could not summarize worker and job statuses (it took too long)");
                None
            }
            Err(e) => {
                warn!(error = %e, "Could not summarize worker and job statuses");
                None
            }
        }
    }
}

fn count_of_worker(workers: &[WorkerStatusCount], status: WorkerStatus) -> i64 {
    workers.iter().filter(|w| w.status == status).map(|w| w.count).sum()
}

fn count_of_job(jobs: &[JobStatusCount], status: JobStatus) -> i64 {
    jobs.iter().filter(|j| j.status == status).map(|j| j.count).sum()
}

fn is_inoperative(workers: &[WorkerStatusCount]) -> bool {
    workers
        .iter()
        .filter(|w| w.count > 0)
        .all(|w| matches!(w.status, WorkerStatus::Offline | WorkerStatus::Error))
}

/// Status of the farm for the given summaries.
pub fn derive_status(workers: &[WorkerStatusCount], jobs: &[JobStatusCount]) -> FarmStatus {
    if is_inoperative(workers) {
        return FarmStatus::Inoperative;
    }

    let any_job_active = count_of_job(jobs, JobStatus::Active) > 0;
    let any_job_queued = count_of_job(jobs, JobStatus::Queued) > 0;
    let work_available = any_job_active || any_job_queued;

    let any_awake = count_of_worker(workers, WorkerStatus::Awake) > 0;
    let any_asleep = count_of_worker(workers, WorkerStatus::Asleep) > 0;
    let all_asleep = !any_awake && any_asleep;

    if any_job_active && any_awake {
        FarmStatus::Active
    } else if work_available {
        FarmStatus::Waiting
    } else if all_asleep {
        FarmStatus::Asleep
    } else {
        FarmStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::eventbus::{Event, Listener, Topic};
    use crate::model::{Job, Worker};
    use crate::store::tests::test_store;

    fn workers(counts: &[(WorkerStatus, i64)]) -> Vec<WorkerStatusCount> {
        counts
            .iter()
            .map(|&(status, count)| WorkerStatusCount { status, count })
            .collect()
    }

    fn jobs(counts: &[(JobStatus, i64)]) -> Vec<JobStatusCount> {
        counts
            .iter()
            .map(|&(status, count)| JobStatusCount { status, count })
            .collect()
    }

    #[test]
    fn no_workers_is_inoperative() {
        assert_eq!(derive_status(&[], &jobs(&[(JobStatus::Active, 1)])), FarmStatus::Inoperative);
        assert_eq!(
            derive_status(
                &workers(&[(WorkerStatus::Offline, 2), (WorkerStatus::Error, 1)]),
                &[]
            ),
            FarmStatus::Inoperative
        );
    }

    #[test]
    fn status_derivation() {
        let awake = workers(&[(WorkerStatus::Awake, 1), (WorkerStatus::Offline, 3)]);
        let asleep = workers(&[(WorkerStatus::Asleep, 2)]);

        assert_eq!(derive_status(&awake, &jobs(&[(JobStatus::Active, 1)])), FarmStatus::Active);
        assert_eq!(derive_status(&awake, &jobs(&[(JobStatus::Queued, 1)])), FarmStatus::Waiting);
        assert_eq!(derive_status(&asleep, &jobs(&[(JobStatus::Active, 1)])), FarmStatus::Waiting);
        assert_eq!(derive_status(&asleep, &jobs(&[(JobStatus::Completed, 4)])), FarmStatus::Asleep);
        assert_eq!(derive_status(&awake, &[]), FarmStatus::Idle);
        assert_eq!(
            derive_status(&workers(&[(WorkerStatus::Starting, 1)]), &[]),
            FarmStatus::Idle
        );
    }

    struct StatusCollector(Mutex<Vec<FarmStatus>>);

    impl Listener for StatusCollector {
        fn on_event(&self, topic: &Topic, event: &Event) -> Result<(), DeliveryError> {
            if let Event::FarmStatus(report) = event {
                assert_eq!(topic, &Topic::farm_status());
                self.0.lock().unwrap().push(report.status);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcasts_only_changes() {
        let store = Arc::new(test_store().await);
        let bus = Arc::new(EventBus::new());
        let collector = Arc::new(StatusCollector(Mutex::new(Vec::new())));
        bus.add_listener(collector.clone());

        let service = FarmStatusService::new(store.clone(), bus, Duration::from_secs(5));
        assert_eq!(service.report().status, FarmStatus::Starting);

        assert!(service.poll().await);
        assert!(!service.poll().await);
        assert_eq!(service.report().status, FarmStatus::Inoperative);

        {
            let conn = store.conn().await.unwrap();
            let mut worker = Worker::new("render-01", "10.0.0.1");
            conn.create_worker(&mut worker).await.unwrap();
            conn.save_worker_status(&mut worker, WorkerStatus::Awake).await.unwrap();
            let mut job = Job::new("shot 010", "simple-blender-render");
            conn.create_job(&mut job).await.unwrap();
            conn.save_job_status(&mut job, JobStatus::Active, "").await.unwrap();
        }

        assert!(service.poll().await);
        assert_eq!(
            *collector.0.lock().unwrap(),
            vec![FarmStatus::Inoperative, FarmStatus::Active]
        );
    }
}
