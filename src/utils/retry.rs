//! Retry configuration for the bounded operational backoff applied at the
//! `call`/`get_notifications` boundary: 10 attempts, 100ms apart, no
//! jitter. The actual retry loops live next to their call sites
//! ([`crate::host::NotificationLogView::get_notifications`], the
//! `EventProcessor`'s `process_upstream_event` call, and `ProcessHost::call`)
//! since each wraps a different async closure; this module is the shared,
//! testable policy they all build their `backon::ExponentialBuilder` from.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::{DEFAULT_OPERATIONAL_RETRY_ATTEMPTS, DEFAULT_OPERATIONAL_RETRY_DELAY_MS};
use crate::error::RunnerError;

/// Configuration for the operational-error retry applied at store/transport
/// boundaries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay between attempts.
    pub delay: Duration,
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(DEFAULT_OPERATIONAL_RETRY_DELAY_MS),
            max_attempts: DEFAULT_OPERATIONAL_RETRY_ATTEMPTS,
        }
    }
}

impl RetryConfig {
    /// Builds the `backon` backoff this policy describes. No jitter: this is
    /// a fixed bounded retry, not a thundering-herd mitigation.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.delay)
            .with_max_times(self.max_attempts)
            .without_jitter()
    }
}

/// Whether `error` should be retried under this policy: only operational
/// errors are; programming errors and business-logic outcomes like a
/// uniqueness conflict or unsatisfied causal dependency never are.
pub fn is_retryable(error: &RunnerError) -> bool {
    error.is_operational()
}
