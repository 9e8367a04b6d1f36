//! Bounded-concurrency scheduler for the job pipeline. A single driver task
//! polls the job queue every 2s when idle and dispatches up to
//! `MAX_CONCURRENT_JOBS` jobs concurrently; the driver never blocks on a
//! running job and re-polls immediately once a slot frees up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use lexiclip_job_store::{Job, JobStore};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub const MAX_CONCURRENT_JOBS: usize = 5;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct WorkerPool {
    job_store: JobStore,
    in_flight: Arc<DashSet<String>>,
    semaphore: Arc<Semaphore>,
    slot_freed: Arc<Notify>,
    cancellation: CancellationToken,
}

impl WorkerPool {
    pub fn new(job_store: JobStore) -> Self {
        Self {
            job_store,
            in_flight: Arc::new(DashSet::new()),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
            slot_freed: Arc::new(Notify::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// A cooperative stop signal: cancelling it lets in-flight jobs finish
    /// but stops the driver from dispatching new ones. No hard kill.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Runs the driver loop until `stop_handle()` is cancelled. `run_job` is
    /// invoked once per dispatched job and owns that job's status
    /// transitions end to end; the driver never awaits it directly.
    pub async fn run<F, Fut>(&self, run_job: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run_job = Arc::new(run_job);

        loop {
            if self.cancellation.is_cancelled() {
                return;
            }

            self.dispatch_eligible(&run_job).await;

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.slot_freed.notified() => {}
                _ = self.cancellation.cancelled() => return,
            }
        }
    }

    /// A job is eligible iff it is `queued` and no running task currently
    /// holds its fingerprint.
    async fn dispatch_eligible<F, Fut>(&self, run_job: &Arc<F>)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(queued) = self.job_store.list_queued().await else {
            return;
        };

        for job in queued {
            if self.in_flight.contains(&job.fingerprint) {
                continue;
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };

            self.in_flight.insert(job.fingerprint.clone());

            let in_flight = self.in_flight.clone();
            let fingerprint = job.fingerprint.clone();
            let run_job = run_job.clone();
            let slot_freed = self.slot_freed.clone();

            tokio::spawn(async move {
                let _permit = permit;
                run_job(job).await;
                in_flight.remove(&fingerprint);
                slot_freed.notify_one();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexiclip_db::Db;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn max_concurrent_jobs_is_five() {
        assert_eq!(MAX_CONCURRENT_JOBS, 5);
    }

    #[test]
    fn in_flight_set_deduplicates_by_fingerprint() {
        let set: DashSet<String> = DashSet::new();
        set.insert("fp1".to_string());
        assert!(set.contains("fp1"));
        assert!(!set.contains("fp2"));
    }

    #[tokio::test]
    async fn stop_handle_halts_the_driver_loop() {
        // Exercises only the cancellation wiring; list_queued against an
        // unconnected pool would hang, so this never reaches dispatch.
        let pool = WorkerPool::new(JobStore::new(Db::from_pool(
            sqlx::PgPool::connect_lazy("postgres://localhost/lexiclip_test_unused").unwrap(),
        )));
        let handle = pool.stop_handle();
        handle.cancel();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let run = pool.run(move |_job| {
            let ran_clone = ran_clone.clone();
            async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        run.await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
