//! `NotificationLogView`: a downstream host's remote-accessor handle onto
//! an upstream host's notification log.

use backon::Retryable;

use crate::error::RunnerError;
use crate::model::{Notification, NotificationId};
use crate::utils::retry::RetryConfig;

use super::HostHandle;

/// Forwards `get_notifications(first, last)` to another host's notification
/// log. In this in-process runtime the "remote call" is a direct async
/// method call on that host's `Arc`; a distributed deployment would swap
/// this for a real RPC client implementing the same narrow surface — any
/// transport that gives per-call futures and surfaces failures back to the
/// caller satisfies the contract.
#[derive(Clone)]
pub struct NotificationLogView {
    upstream: HostHandle,
    retry: RetryConfig,
}

impl NotificationLogView {
    pub fn new(upstream: HostHandle) -> Self {
        Self {
            upstream,
            retry: RetryConfig::default(),
        }
    }

    /// Half-open `[first, last)` read, wrapped in the same bounded
    /// operational retry every store/transport boundary uses (10 attempts,
    /// 100ms apart) so a transient hiccup on the upstream side doesn't fail
    /// a downstream's pull outright.
    pub async fn get_notifications(
        &self,
        first: Option<NotificationId>,
        last: Option<NotificationId>,
    ) -> Result<Vec<Notification>, RunnerError> {
        (|| async { self.upstream.get_notifications(first, last).await })
            .retry(self.retry.backoff())
            .when(crate::utils::retry::is_retryable)
            .await
    }
}
