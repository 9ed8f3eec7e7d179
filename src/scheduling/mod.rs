//! Job scheduling and time
//!
//! Pacing loops, live-wait timeouts and buffer retries are one-shot jobs
//! submitted to a [`Scheduler`]. A job is a closure holding only what it
//! needs (usually a weak handle to its stream) and is cancelled through the
//! [`JobId`] returned at submission.
//!
//! Play engines read time through [`Clock`] so the same code runs against the
//! wall clock in production and a virtual clock in tests.

mod runtime;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub use runtime::TokioScheduler;

/// Work submitted to a scheduler
pub type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Handle of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Delay-based job scheduler
pub trait Scheduler: Send + Sync {
    /// Run `job` once after `delay`
    fn add_scheduled_once_job(&self, delay: Duration, job: Job) -> JobId;

    /// Cancel a job; unknown or already-run ids are ignored
    fn remove_scheduled_job(&self, id: JobId);
}

/// Millisecond time source
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Monotonic clock counting from its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Convert a millisecond delay to a `Duration`, clamping negatives to zero
pub fn delay_ms(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_unique() {
        let a = JobId::next();
        let b = JobId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(first >= 0);
        assert!(second >= first);
    }

    #[test]
    fn test_delay_ms_clamps() {
        assert_eq!(delay_ms(-5), Duration::ZERO);
        assert_eq!(delay_ms(40), Duration::from_millis(40));
    }
}
