//! Tokio-backed scheduler

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::{Job, JobId, Scheduler};

/// Scheduler running each job in its own tokio task
///
/// Jobs take synchronous locks, so the job body runs on the blocking pool
/// once its delay has elapsed. Cancelling a job aborts the sleeping task; a
/// job that has already started is left to finish.
pub struct TokioScheduler {
    handle: Handle,
    jobs: Arc<DashMap<JobId, AbortHandle>>,
}

impl TokioScheduler {
    /// Create a scheduler spawning onto the given runtime
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Number of jobs waiting for their delay to elapse
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }
}

impl Scheduler for TokioScheduler {
    fn add_scheduled_once_job(&self, delay: Duration, job: Job) -> JobId {
        let id = JobId::next();
        let jobs = Arc::clone(&self.jobs);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let task = self.handle.spawn(async move {
            // Removal below must not run before the handle is in the table
            if registered_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            jobs.remove(&id);
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                tracing::error!(job = ?id, error = %e, "Scheduled job failed");
            }
        });

        self.jobs.insert(id, task.abort_handle());
        let _ = registered_tx.send(());

        tracing::trace!(job = ?id, delay_ms = delay.as_millis() as u64, "Job scheduled");
        id
    }

    fn remove_scheduled_job(&self, id: JobId) {
        if let Some((_, handle)) = self.jobs.remove(&id) {
            handle.abort();
            tracing::trace!(job = ?id, "Job cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_after_delay() {
        let scheduler = TokioScheduler::new(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();

        scheduler.add_scheduled_once_job(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = tx.send(42);
            }),
        );
        assert_eq!(scheduler.pending_jobs(), 1);

        assert_eq!(rx.await.unwrap(), 42);
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_immediate_jobs_leave_no_entries() {
        let scheduler = TokioScheduler::new(Handle::current());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..200 {
            let tx = tx.clone();
            scheduler.add_scheduled_once_job(
                Duration::ZERO,
                Box::new(move || {
                    let _ = tx.send(i);
                }),
            );
        }
        for _ in 0..200 {
            rx.recv().await.unwrap();
        }
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_never_runs() {
        let scheduler = TokioScheduler::new(Handle::current());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let id = scheduler.add_scheduled_once_job(
            Duration::from_millis(50),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        scheduler.remove_scheduled_job(id);
        assert_eq!(scheduler.pending_jobs(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));

        // Removing again is a no-op
        scheduler.remove_scheduled_job(id);
    }
}
