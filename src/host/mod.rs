//! `ProcessHost`: one instance of a process application running its four
//! background workers (db worker, puller, event processor, promoter).
//! `HostHandle` (`Arc<ProcessHost>`) is the actor-style RPC surface other
//! hosts and the `Runner` call through.

mod db_worker;
mod event_processor;
mod notification_log;
mod promoter;
mod puller;

pub use notification_log::NotificationLogView;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use backon::Retryable;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{error, instrument};

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::model::{HeadsMap, Notification, NotificationId, PipelineId, PositionsMap, Prompt};
use crate::process::ProcessApplication;
use crate::store::RecordStore;

use db_worker::{DbRequest, DbResponse, DbWorkerHandle};

/// Host lifecycle states. A host moves `Created -> Inited -> Stopped` and
/// never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Created,
    Inited,
    Stopped,
}

/// Sentinel-carrying queue item for the event queue: a `Shutdown` is
/// enqueued on every queue so each worker observes shutdown even while
/// blocked waiting for work.
pub(crate) enum EventItem {
    Work(crate::process::DecodedEvent, NotificationId, String),
    Shutdown,
}

pub(crate) enum PromptItem {
    Item(Prompt),
    Shutdown,
}

pub struct ProcessHost {
    name: String,
    pipeline: PipelineId,
    config: RunnerConfig,
    store: Arc<dyn RecordStore>,
    db: DbWorkerHandle,
    state: Mutex<HostState>,
    heads: Mutex<HeadsMap>,
    positions: Mutex<PositionsMap>,
    prompted: Notify,
    stopped: AtomicBool,
    upstream_handles: RwLock<HashMap<String, NotificationLogView>>,
    downstream_handles: RwLock<HashMap<String, HostHandle>>,
    event_tx: mpsc::UnboundedSender<EventItem>,
    prompt_tx: mpsc::UnboundedSender<PromptItem>,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The handle other hosts and the `Runner` hold — clone-able, cheap, and
/// the unit of the host RPC surface.
pub type HostHandle = Arc<ProcessHost>;

impl ProcessHost {
    /// Builds a host in the `Created` state and spawns its four daemon
    /// worker loops. The host isn't usable until [`ProcessHost::init`] runs.
    pub(crate) fn spawn(
        name: impl Into<String>,
        pipeline: PipelineId,
        config: RunnerConfig,
        store: Arc<dyn RecordStore>,
        process: Arc<dyn ProcessApplication>,
    ) -> HostHandle {
        let name = name.into();
        let db = db_worker::spawn(process);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();

        let host = Arc::new(ProcessHost {
            name,
            pipeline,
            config,
            store,
            db,
            state: Mutex::new(HostState::Created),
            heads: Mutex::new(HeadsMap::default()),
            positions: Mutex::new(PositionsMap::default()),
            prompted: Notify::new(),
            stopped: AtomicBool::new(false),
            upstream_handles: RwLock::new(HashMap::new()),
            downstream_handles: RwLock::new(HashMap::new()),
            event_tx,
            prompt_tx,
            worker_tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(puller::run(host.clone())));
        tasks.push(tokio::spawn(event_processor::run(host.clone(), event_rx)));
        tasks.push(tokio::spawn(promoter::run(host.clone(), prompt_rx)));
        *host.worker_tasks.lock().unwrap() = tasks;

        host
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> PipelineId {
        self.pipeline
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// `Created -> Inited`: subscribes the prompt hook, installs
    /// `follow()` relations, then resets readers and positions from the
    /// tracking table.
    #[instrument(name = "host.init", skip_all, fields(process = %self.name, pipeline = self.pipeline))]
    pub async fn init(
        &self,
        upstream_handles: HashMap<String, NotificationLogView>,
        downstream_handles: HashMap<String, HostHandle>,
    ) -> Result<(), RunnerError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != HostState::Created {
                return Err(RunnerError::Programming(format!(
                    "host '{}' already initialized",
                    self.name
                )));
            }
            *state = HostState::Inited;
        }

        let upstream_names: Vec<String> = upstream_handles.keys().cloned().collect();
        *self.upstream_handles.write().unwrap() = upstream_handles;
        *self.downstream_handles.write().unwrap() = downstream_handles;

        let prompt_tx = self.prompt_tx.clone();
        let pipeline = self.pipeline;
        let self_name = self.name.clone();
        let hook: crate::process::PromptHook = Arc::new(move |head| {
            let _ = prompt_tx.send(PromptItem::Item(Prompt::with_head(
                self_name.clone(),
                pipeline,
                head,
            )));
        });
        self.db.send(DbRequest::InstallPromptHook(hook)).await;

        for upstream in &upstream_names {
            self.db
                .send(DbRequest::Follow {
                    upstream: upstream.clone(),
                })
                .await;
        }

        self.db.send(DbRequest::ResetReaders).await;
        self.reset_positions(upstream_names).await;

        Ok(())
    }

    /// Full local reset, triggered by an unsatisfied causal dependency or
    /// any other unexpected processing failure: re-derives both readers and
    /// positions from the tracking table, then re-arms so a prompt already
    /// seen isn't lost. The caller (`event_processor::run`) is responsible
    /// for flushing the event queue first, since it is the queue's sole
    /// owner.
    pub(crate) async fn trigger_reset(&self) {
        self.db.send(DbRequest::ResetReaders).await;
        let upstream_names: Vec<String> = self.upstream_handles.read().unwrap().keys().cloned().collect();
        self.reset_positions(upstream_names).await;
    }

    /// Re-derives `positions` from the tracking table: the tracking table
    /// is always the source of truth, so this is what both `init` and
    /// `trigger_reset` ultimately rely on.
    async fn reset_positions(&self, upstream_names: Vec<String>) {
        if let DbResponse::Positions(positions) = self
            .db
            .send(DbRequest::ResetPositions { upstream_names })
            .await
        {
            let mut guard = self.positions.lock().unwrap();
            for (upstream, recorded) in positions {
                guard.set(&upstream, recorded.unwrap_or(0));
            }
        }
        // Re-arm on reset completion so a host with unfetched notifications
        // but a cleared signal never deadlocks waiting for a prompt that
        // already arrived.
        self.prompted.notify_one();
    }

    /// Routes `method(args…)` to the process application through the
    /// DBWorker, retrying on operational errors at this boundary. Fails
    /// immediately (no retry) if the host isn't yet `Inited`.
    #[instrument(name = "host.call", skip(self, args), fields(process = %self.name, %method))]
    pub async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value, RunnerError> {
        {
            let state = *self.state.lock().unwrap();
            match state {
                HostState::Created => {
                    return Err(RunnerError::Programming(
                        "call() before init()".to_string(),
                    ))
                }
                HostState::Stopped => {
                    return Err(RunnerError::Programming(format!(
                        "host '{}' is stopped",
                        self.name
                    )))
                }
                HostState::Inited => {}
            }
        }

        let backoff = crate::utils::retry::RetryConfig::default().backoff();

        let result = (|| async {
            match self
                .db
                .send(DbRequest::Call {
                    method: method.to_string(),
                    args: args.clone(),
                })
                .await
            {
                DbResponse::CallResult(result) => result,
                _ => Err(RunnerError::Operational("db worker gave no reply".to_string())),
            }
        })
        .retry(backoff)
        .when(crate::utils::retry::is_retryable)
        .await;

        if let Err(e) = &result {
            error!(process = %self.name, %method, error = %e, "process call failed");
        }
        result
    }

    /// Intake for a prompt pushed by an upstream: merges the new head into
    /// this host's view of that upstream and wakes the Puller if the head
    /// actually advanced.
    pub async fn prompt(&self, incoming: Prompt) {
        let changed = match incoming.head {
            Some(head) => {
                let mut heads = self.heads.lock().unwrap();
                heads.merge(&incoming.sender, head)
            }
            None => true,
        };
        if changed {
            self.prompted.notify_one();
        }
    }

    /// Pushes a headless prompt onto this host's own downstream-prompt
    /// queue, nudging every downstream to pull even though nothing new was
    /// necessarily just committed here. The Promoter resolves the head by
    /// querying the store's current max notification id before forwarding —
    /// this is how an operator forces downstreams to catch up without
    /// having to know (or wait for) this process's next commit.
    pub async fn nudge_downstreams(&self) {
        let _ = self
            .prompt_tx
            .send(PromptItem::Item(Prompt::headless(self.name.clone(), self.pipeline)));
    }

    /// `get_notifications(first, last)`: reads this host's own log.
    /// Half-open `[first, last)`.
    pub async fn get_notifications(
        &self,
        first: Option<NotificationId>,
        last: Option<NotificationId>,
    ) -> Result<Vec<Notification>, RunnerError> {
        if self.is_stopped() {
            return Err(RunnerError::Programming(format!(
                "host '{}' is stopped",
                self.name
            )));
        }
        Ok(self
            .store
            .get_notifications(self.pipeline, &self.name, first, last)
            .await?)
    }

    /// `Inited -> Stopped`: latches `has_been_stopped`, pushes a sentinel
    /// onto every queue, and waits for the worker tasks to exit.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == HostState::Stopped {
                return;
            }
            *state = HostState::Stopped;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.prompted.notify_one();
        let _ = self.event_tx.send(EventItem::Shutdown);
        let _ = self.prompt_tx.send(PromptItem::Shutdown);
        self.db.shutdown();

        let tasks = std::mem::take(&mut *self.worker_tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
    }
}
