//! EventProcessor: applies each decoded upstream event through the process
//! application, atomically recording tracking + new events. A duplicate
//! delivery is a no-op; an unsatisfied causal dependency triggers a local
//! reset rather than surfacing further.
//!
//! Prompt-building is not this worker's job here — it is handled uniformly
//! by the `PromptHook` the process application fires itself on commit (see
//! [`crate::process::StoreBackedProcess::announce`]), whether triggered from
//! this loop or from a direct external `call`.

use backon::Retryable;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::RunnerError;
use crate::utils::retry::RetryConfig;

use super::db_worker::{DbRequest, DbResponse};
use super::{EventItem, HostHandle};

pub async fn run(host: HostHandle, mut event_rx: mpsc::UnboundedReceiver<EventItem>) {
    let retry = RetryConfig::default();

    'outer: while let Some(item) = event_rx.recv().await {
        let (event, notification_id, upstream) = match item {
            EventItem::Work(event, notification_id, upstream) => (event, notification_id, upstream),
            EventItem::Shutdown => break,
        };

        let outcome = (|| async {
            match host
                .db
                .send(DbRequest::ProcessUpstreamEvent {
                    event: event.clone(),
                    notification_id,
                    upstream: upstream.clone(),
                })
                .await
            {
                DbResponse::Outcome(result) => result,
                _ => Err(RunnerError::Operational("db worker gave no reply".to_string())),
            }
        })
        .retry(retry.backoff())
        .when(crate::utils::retry::is_retryable)
        .await;

        match outcome {
            Ok(_) => {}
            Err(e) if e.is_uniqueness_conflict() => {
                info!(process = %host.name, %upstream, notification_id, "duplicate delivery, already tracked");
            }
            Err(e) if e.is_causal_dependency_unsatisfied() => {
                warn!(process = %host.name, %upstream, notification_id, error = %e, "causal dependency unsatisfied, resetting");
                if flush_queue(&mut event_rx) {
                    break 'outer;
                }
                host.trigger_reset().await;
            }
            Err(e) => {
                // Any failure other than a uniqueness conflict resets the
                // host; causal-dependency failures are handled above but
                // every other unexpected failure resets too.
                error!(process = %host.name, %upstream, notification_id, error = %e, "failed to process upstream event, resetting");
                if flush_queue(&mut event_rx) {
                    break 'outer;
                }
                host.trigger_reset().await;
            }
        }
    }
}

/// Drains the upstream event queue ahead of a reset, so positions and
/// reader state get re-derived from the tracking table against an empty
/// queue rather than racing still-pending work. Draining here (rather than
/// inside `ProcessHost::trigger_reset`) keeps queue ownership with this
/// worker, which is the only consumer of `event_rx`. Returns `true` if a
/// shutdown sentinel was observed while draining, in which case the caller
/// should exit rather than reset.
fn flush_queue(event_rx: &mut mpsc::UnboundedReceiver<EventItem>) -> bool {
    loop {
        match event_rx.try_recv() {
            Ok(EventItem::Shutdown) => return true,
            Ok(EventItem::Work(..)) => continue,
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DecodedEvent;

    fn work_item(id: i64) -> EventItem {
        EventItem::Work(
            DecodedEvent {
                topic: "x".to_string(),
                state: serde_json::Value::Null,
            },
            id,
            "a".to_string(),
        )
    }

    #[test]
    fn flush_queue_drains_pending_work_and_reports_no_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(work_item(1)).unwrap();
        tx.send(work_item(2)).unwrap();
        assert!(!flush_queue(&mut rx));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn flush_queue_reports_shutdown_when_sentinel_is_queued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(work_item(1)).unwrap();
        tx.send(EventItem::Shutdown).unwrap();
        assert!(flush_queue(&mut rx));
    }
}
