//! Runtime configuration for the relay and the outbox GC.
//!
//! These are the validated values the processors run with. Loading them
//! from a file is the server crate's job.

use std::time::Duration;

/// Relay engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum number of events fetched per poll.
    pub batch_size: u32,
    /// Maximum number of events processed at the same time.
    pub concurrency: usize,
    /// Deadline for each store and sink call.
    pub operation_timeout: Duration,
    /// Pause after an empty or failed poll.
    pub idle_delay: Duration,
    /// Extra attempts for a transiently failing event within one dispatch.
    pub immediate_retries: u32,
    /// Pause before the single retry of a publish rejected by backpressure.
    pub backpressure_wait: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 10,
            operation_timeout: Duration::from_secs(5),
            idle_delay: Duration::from_secs(1),
            immediate_retries: 0,
            backpressure_wait: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    pub fn with_immediate_retries(mut self, retries: u32) -> Self {
        self.immediate_retries = retries;
        self
    }

    pub fn with_backpressure_wait(mut self, wait: Duration) -> Self {
        self.backpressure_wait = wait;
        self
    }
}

/// Outbox GC schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxGcConfig {
    /// Time between the end of one sweep and the start of the next.
    pub interval: Duration,
    /// Deadline for a single delete attempt.
    pub timeout: Duration,
    /// Extra attempts after a failed delete, made without delay.
    pub retries: u32,
}

impl Default for OutboxGcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            retries: 3,
        }
    }
}

impl OutboxGcConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}
