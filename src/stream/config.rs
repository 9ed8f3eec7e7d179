//! Play engine configuration

use std::time::Duration;

/// Play engine tuning options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between insufficient-bandwidth notifications (zero = never)
    pub buffer_check_interval: Duration,

    /// Pending connection messages above which delivery is deferred
    pub underrun_trigger: u64,

    /// How long a `start == -2` subscriber waits for a publisher
    pub live_wait_timeout: Duration,

    /// Delay before retrying a message the client could not take yet
    pub retry_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_check_interval: Duration::ZERO,
            underrun_trigger: 10,
            live_wait_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_millis(10),
        }
    }
}

impl EngineConfig {
    /// Set the insufficient-bandwidth notification interval
    pub fn buffer_check_interval(mut self, interval: Duration) -> Self {
        self.buffer_check_interval = interval;
        self
    }

    /// Set the underrun trigger
    pub fn underrun_trigger(mut self, pending: u64) -> Self {
        self.underrun_trigger = pending;
        self
    }

    /// Set the live wait timeout
    pub fn live_wait_timeout(mut self, timeout: Duration) -> Self {
        self.live_wait_timeout = timeout;
        self
    }

    /// Set the retry interval
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub(crate) fn buffer_check_interval_ms(&self) -> i64 {
        i64::try_from(self.buffer_check_interval.as_millis()).unwrap_or(i64::MAX)
    }
}
