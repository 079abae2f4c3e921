//! DBWorker: the single task that serializes all access to a host's process
//! application. Every other component reaches the process only by sending a
//! [`DbRequest`] here and awaiting the reply — direct access from any other
//! task would break the single-writer invariant the rest of the host relies on.

use tokio::sync::{mpsc, oneshot};

use crate::error::RunnerError;
use crate::model::{CausalDependency, Notification, NotificationId};
use crate::process::{DecodedEvent, ProcessApplication, ProcessOutcome, PromptHook};
use std::sync::Arc;

/// One unit of work the DBWorker executes against the process application.
/// The explicit enum (rather than a boxed closure) keeps every operation
/// the host core actually needs statically typed end to end.
pub enum DbRequest {
    Follow {
        upstream: String,
    },
    ResetReaders,
    ResetPositions {
        upstream_names: Vec<String>,
    },
    CheckCausalDependencies {
        upstream: String,
        deps: Vec<CausalDependency>,
    },
    DecodeNotification(Notification),
    ProcessUpstreamEvent {
        event: DecodedEvent,
        notification_id: NotificationId,
        upstream: String,
    },
    Call {
        method: String,
        args: serde_json::Value,
    },
    InstallPromptHook(PromptHook),
    Shutdown,
}

pub enum DbResponse {
    Unit,
    /// `upstream -> recorded position` pairs, for `ResetPositions`.
    Positions(Vec<(String, Option<NotificationId>)>),
    Decoded(Result<DecodedEvent, RunnerError>),
    Outcome(Result<ProcessOutcome, RunnerError>),
    CausalCheck(Result<(), RunnerError>),
    CallResult(Result<serde_json::Value, RunnerError>),
}

pub struct DbJob {
    pub request: DbRequest,
    pub reply: oneshot::Sender<DbResponse>,
}

/// Handle used by every other component to submit work to the DBWorker.
#[derive(Clone)]
pub struct DbWorkerHandle {
    tx: mpsc::UnboundedSender<DbJob>,
}

impl DbWorkerHandle {
    pub async fn send(&self, request: DbRequest) -> DbResponse {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DbJob { request, reply }).is_err() {
            // Worker task has exited (host stopped); callers treat a closed
            // channel as "nothing more will happen" rather than panicking.
            return DbResponse::Unit;
        }
        rx.await.unwrap_or(DbResponse::Unit)
    }

    pub fn shutdown(&self) {
        let (reply, _rx) = oneshot::channel();
        let _ = self.tx.send(DbJob {
            request: DbRequest::Shutdown,
            reply,
        });
    }
}

/// Spawns the DBWorker task and returns a handle to it. The process
/// application itself never leaves this task's exclusive custody.
pub fn spawn(process: Arc<dyn ProcessApplication>) -> DbWorkerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<DbJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if matches!(job.request, DbRequest::Shutdown) {
                break;
            }
            let response = execute(&process, job.request).await;
            // A dropped receiver means the caller stopped waiting; the
            // result was still captured correctly, so this isn't an error.
            let _ = job.reply.send(response);
        }
    });
    DbWorkerHandle { tx }
}

async fn execute(process: &Arc<dyn ProcessApplication>, request: DbRequest) -> DbResponse {
    match request {
        DbRequest::Shutdown => DbResponse::Unit,
        DbRequest::Follow { upstream } => {
            process.follow(&upstream).await;
            DbResponse::Unit
        }
        DbRequest::ResetReaders => {
            for upstream in process.readers().await {
                process.set_reader_position_from_tracking_records(&upstream).await;
            }
            DbResponse::Unit
        }
        DbRequest::ResetPositions { upstream_names } => {
            let mut positions = Vec::with_capacity(upstream_names.len());
            for upstream in upstream_names {
                let recorded = process.get_recorded_position(&upstream).await;
                positions.push((upstream, recorded));
            }
            DbResponse::Positions(positions)
        }
        DbRequest::CheckCausalDependencies { upstream, deps } => {
            DbResponse::CausalCheck(process.check_causal_dependencies(&upstream, &deps).await)
        }
        DbRequest::DecodeNotification(notification) => {
            DbResponse::Decoded(process.get_event_from_notification(&notification).await)
        }
        DbRequest::ProcessUpstreamEvent {
            event,
            notification_id,
            upstream,
        } => DbResponse::Outcome(
            process
                .process_upstream_event(event, notification_id, &upstream)
                .await,
        ),
        DbRequest::Call { method, args } => DbResponse::CallResult(process.call(&method, args).await),
        DbRequest::InstallPromptHook(hook) => {
            process.set_prompt_hook(hook).await;
            DbResponse::Unit
        }
    }
}
