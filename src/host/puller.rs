//! Puller: the worker that turns a prompt (or the periodic fallback) into a
//! bounded read of each upstream's notification log, decodes and causally
//! checks each notification, and hands the result to the `EventProcessor`
//! over the event queue.

use std::time::Duration;

use tracing::{error, warn};

use super::db_worker::{DbRequest, DbResponse};
use super::{EventItem, HostHandle};

pub async fn run(host: HostHandle) {
    loop {
        if host.is_stopped() {
            return;
        }

        tokio::select! {
            _ = host.prompted.notified() => {}
            _ = tokio::time::sleep(host.config.poll_interval) => {}
        }

        if host.is_stopped() {
            return;
        }

        let current_heads = host.heads.lock().unwrap().snapshot();
        let upstreams: Vec<String> = host.upstream_handles.read().unwrap().keys().cloned().collect();
        let mut more_available = false;

        for upstream in upstreams {
            if host.is_stopped() {
                return;
            }

            let handle = host.upstream_handles.read().unwrap().get(&upstream).cloned();
            let Some(handle) = handle else { continue };

            let current_position = host.positions.lock().unwrap().get(&upstream);
            let known_head = current_heads.get(&upstream).copied();

            if let Some(head) = known_head {
                if current_position >= head {
                    // up to date with the latest known head; nothing to do
                    continue;
                }
            }

            let first = current_position + 1;
            // Bounded fetch when the head is known; unbounded (last = None)
            // when it isn't, e.g. at startup or after a reset.
            let last = known_head.map(|_| first + host.config.range_limit);

            let notifications = match handle.get_notifications(Some(first), last).await {
                Ok(n) => n,
                Err(e) => {
                    error!(process = %host.name, %upstream, error = %e, "failed to pull notifications");
                    continue;
                }
            };

            if notifications.len() as i64 >= host.config.range_limit {
                // Re-arm on a full batch rather than waiting for the next
                // external prompt, since a full batch means the upstream
                // likely has more waiting.
                more_available = true;
            }

            'upstream: for notification in notifications {
                if host.is_stopped() {
                    return;
                }

                let decoded = match host
                    .db
                    .send(DbRequest::DecodeNotification(notification.clone()))
                    .await
                {
                    DbResponse::Decoded(Ok(decoded)) => decoded,
                    DbResponse::Decoded(Err(e)) => {
                        error!(process = %host.name, %upstream, error = %e, "failed to decode notification");
                        break 'upstream;
                    }
                    _ => break 'upstream,
                };

                let causal = host
                    .db
                    .send(DbRequest::CheckCausalDependencies {
                        upstream: upstream.clone(),
                        deps: notification.causal_dependencies.clone(),
                    })
                    .await;

                match causal {
                    DbResponse::CausalCheck(Ok(())) => {}
                    DbResponse::CausalCheck(Err(e)) if e.is_causal_dependency_unsatisfied() => {
                        warn!(process = %host.name, %upstream, error = %e, "causal dependency unsatisfied, resetting");
                        host.trigger_reset().await;
                        break 'upstream;
                    }
                    DbResponse::CausalCheck(Err(e)) => {
                        error!(process = %host.name, %upstream, error = %e, "causal dependency check failed");
                        break 'upstream;
                    }
                    _ => break 'upstream,
                }

                host.positions.lock().unwrap().advance(&upstream, notification.id);
                let _ = host
                    .event_tx
                    .send(EventItem::Work(decoded, notification.id, upstream.clone()));
            }
        }

        if more_available {
            host.prompted.notify_one();
        }

        tokio::time::sleep(Duration::from_millis(crate::config::PULLER_CYCLE_DELAY_MS)).await;
    }
}
