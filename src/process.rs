//! Process application contract.
//!
//! The runner treats a process application as an opaque durable
//! consumer+producer: it decodes a notification, applies it through
//! business policy, and the result is written — tracking row and new
//! events — atomically. This module defines the trait the core schedules
//! against plus [`StoreBackedProcess`], a generic implementation that does
//! the tracking/transaction bookkeeping and defers only the business
//! decision ("what new events does this upstream event produce") to a
//! [`Policy`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::RunnerError;
use crate::model::{CausalDependency, NewEvent, Notification, NotificationId, PipelineId};
use crate::store::{self, AppendOutcome, RecordStore};

/// A decoded upstream event, ready for business policy. The source
/// notification's `topic`/`state` pass through unchanged; real
/// deployments would decode `state` into a concrete domain type here.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub topic: String,
    pub state: serde_json::Value,
}

impl From<&Notification> for DecodedEvent {
    fn from(n: &Notification) -> Self {
        Self {
            topic: n.topic.clone(),
            state: n.state.clone(),
        }
    }
}

/// Result of successfully applying one upstream event.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub new_events: Vec<Notification>,
}

/// Callback a host injects into a process application at `init` time so it
/// can announce "I just committed notifiable events, up to this id" without
/// knowing anything about hosts, queues, or the runner — an explicit,
/// per-instance hook in place of a process-wide pub/sub registry. Invoked
/// with the highest notification id among the newly committed, notifiable
/// events.
pub type PromptHook = Arc<dyn Fn(NotificationId) + Send + Sync>;

/// The business decision a process application makes for one upstream
/// event: zero or more new events to append to its own log.
pub trait Policy: Send + Sync {
    fn handle(&self, upstream: &str, event: &DecodedEvent) -> Vec<NewEvent>;
}

/// A policy that produces no new events — useful for terminal processes in
/// tests (a process that only records what it has seen).
pub struct NoopPolicy;

impl Policy for NoopPolicy {
    fn handle(&self, _upstream: &str, _event: &DecodedEvent) -> Vec<NewEvent> {
        Vec::new()
    }
}

/// A named durable consumer+producer: applies upstream notifications via
/// its policy and emits new events. The runner core never calls these
/// directly from more than one worker at a time per process, so
/// implementations may assume single-threaded access per call, even though
/// the trait requires `Send + Sync` to live behind an `Arc` shared with the
/// host's DBWorker task.
#[async_trait]
pub trait ProcessApplication: Send + Sync {
    /// This process's own name (unique within the system).
    fn name(&self) -> &str;

    /// Upstream names currently followed.
    async fn readers(&self) -> Vec<String>;

    /// Register `upstream` as followed. Idempotent.
    async fn follow(&self, upstream: &str);

    /// Decode a raw notification into an event ready for policy.
    async fn get_event_from_notification(
        &self,
        notification: &Notification,
    ) -> Result<DecodedEvent, RunnerError>;

    /// Verifies every causal dependency the event declares has already
    /// been processed locally. Raises
    /// [`RunnerError::CausalDependencyUnsatisfied`] on the first one that
    /// hasn't.
    async fn check_causal_dependencies(
        &self,
        upstream: &str,
        deps: &[CausalDependency],
    ) -> Result<(), RunnerError>;

    /// Applies `event` (sourced from `notification_id` on `upstream`) and
    /// writes the result. Inserts the tracking record and appends any new
    /// events in one transaction; a duplicate delivery surfaces as
    /// [`RunnerError::UniquenessConflict`], not a new event.
    async fn process_upstream_event(
        &self,
        event: DecodedEvent,
        notification_id: NotificationId,
        upstream: &str,
    ) -> Result<ProcessOutcome, RunnerError>;

    /// Last notification id of `upstream` this process has a tracking
    /// record for, or `None` if it has never processed one.
    async fn get_recorded_position(&self, upstream: &str) -> Option<NotificationId>;

    /// Re-derives the in-memory reader position for `upstream` from the
    /// tracking table, the authoritative source. Returns the re-derived
    /// position.
    async fn set_reader_position_from_tracking_records(
        &self,
        upstream: &str,
    ) -> NotificationId;

    /// Generic named-method invocation, used by tests and external clients
    /// to drive a process application directly rather than through the
    /// upstream/downstream flow. The default rejects every method name;
    /// implementations opt in to the methods they want callable this way.
    async fn call(&self, method: &str, _args: serde_json::Value) -> Result<serde_json::Value, RunnerError> {
        Err(RunnerError::Programming(format!(
            "process '{}' has no callable method '{method}'",
            self.name()
        )))
    }

    /// Installs the host's [`PromptHook`]. Called once, during `init`.
    /// Default is a no-op for implementations that never produce
    /// notifiable events outside the upstream-driven path.
    async fn set_prompt_hook(&self, _hook: PromptHook) {}
}

/// Generic [`ProcessApplication`] backed directly by a [`RecordStore`],
/// deferring only business policy. Every process in the integration test
/// suite is one of these.
pub struct StoreBackedProcess<P: Policy> {
    name: String,
    pipeline: PipelineId,
    store: Arc<dyn RecordStore>,
    policy: P,
    readers: Mutex<HashSet<String>>,
    prompt_hook: Mutex<Option<PromptHook>>,
}

impl<P: Policy> StoreBackedProcess<P> {
    pub fn new(
        name: impl Into<String>,
        pipeline: PipelineId,
        store: Arc<dyn RecordStore>,
        policy: P,
    ) -> Self {
        Self {
            name: name.into(),
            pipeline,
            store,
            policy,
            readers: Mutex::new(HashSet::new()),
            prompt_hook: Mutex::new(None),
        }
    }

    /// Fires the prompt hook (if installed) with the highest id among
    /// `events`, but only if at least one is notifiable.
    fn announce(&self, events: &[Notification]) {
        let Some(head) = events.iter().filter(|e| e.is_notifiable).map(|e| e.id).max() else {
            return;
        };
        if let Some(hook) = self.prompt_hook.lock().unwrap().as_ref() {
            hook(head);
        }
    }
}

#[async_trait]
impl<P: Policy> ProcessApplication for StoreBackedProcess<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn readers(&self) -> Vec<String> {
        self.readers.lock().unwrap().iter().cloned().collect()
    }

    async fn follow(&self, upstream: &str) {
        self.readers.lock().unwrap().insert(upstream.to_string());
    }

    async fn get_event_from_notification(
        &self,
        notification: &Notification,
    ) -> Result<DecodedEvent, RunnerError> {
        Ok(DecodedEvent::from(notification))
    }

    async fn check_causal_dependencies(
        &self,
        upstream: &str,
        deps: &[CausalDependency],
    ) -> Result<(), RunnerError> {
        if let Some(unsatisfied) =
            store::first_unsatisfied_dependency(self.store.as_ref(), self.pipeline, &self.name, deps)
                .await?
        {
            return Err(RunnerError::CausalDependencyUnsatisfied {
                upstream: upstream.to_string(),
                dep_pipeline: unsatisfied.pipeline,
                dep_notification: unsatisfied.notification_id,
            });
        }
        Ok(())
    }

    async fn process_upstream_event(
        &self,
        event: DecodedEvent,
        notification_id: NotificationId,
        upstream: &str,
    ) -> Result<ProcessOutcome, RunnerError> {
        let new_events = self.policy.handle(upstream, &event);
        let outcome = self
            .store
            .insert_tracking_and_append(self.pipeline, &self.name, upstream, notification_id, new_events)
            .await?;
        match outcome {
            AppendOutcome::Applied { new_events, .. } => {
                self.announce(&new_events);
                Ok(ProcessOutcome { new_events })
            }
            AppendOutcome::DuplicateTracking => Err(RunnerError::UniquenessConflict {
                downstream: self.name.clone(),
                upstream: upstream.to_string(),
                pipeline_id: self.pipeline,
                notification_id,
            }),
        }
    }

    async fn get_recorded_position(&self, upstream: &str) -> Option<NotificationId> {
        self.store
            .max_tracking_for_upstream(self.pipeline, &self.name, upstream)
            .await
            .unwrap_or(None)
    }

    async fn set_reader_position_from_tracking_records(
        &self,
        upstream: &str,
    ) -> NotificationId {
        self.get_recorded_position(upstream).await.unwrap_or(0)
    }

    /// Supports one method, `"emit"`: appends `args` (a JSON array of
    /// `{"topic": str, "state": value}`) to this process's own log,
    /// un-triggered by any upstream. This is how a root process with no
    /// upstream of its own is driven externally.
    async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value, RunnerError> {
        if method != "emit" {
            return Err(RunnerError::Programming(format!(
                "process '{}' has no callable method '{method}'",
                self.name
            )));
        }
        let specs: Vec<EmitSpec> = serde_json::from_value(args)
            .map_err(|e| RunnerError::Programming(format!("invalid 'emit' args: {e}")))?;
        let new_events = specs
            .into_iter()
            .map(|s| NewEvent {
                topic: s.topic,
                state: s.state,
                causal_dependencies: s.causal_dependencies,
                is_notifiable: s.is_notifiable.unwrap_or(true),
            })
            .collect();
        let written = self.store.append(self.pipeline, &self.name, new_events).await?;
        self.announce(&written);
        serde_json::to_value(&written).map_err(|e| RunnerError::Programming(e.to_string()))
    }

    async fn set_prompt_hook(&self, hook: PromptHook) {
        *self.prompt_hook.lock().unwrap() = Some(hook);
    }
}

#[derive(serde::Deserialize)]
struct EmitSpec {
    topic: String,
    #[serde(default)]
    state: serde_json::Value,
    #[serde(default)]
    causal_dependencies: Vec<CausalDependency>,
    #[serde(default)]
    is_notifiable: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct EchoPolicy;

    impl Policy for EchoPolicy {
        fn handle(&self, _upstream: &str, event: &DecodedEvent) -> Vec<NewEvent> {
            vec![NewEvent::new(event.topic.clone(), event.state.clone())]
        }
    }

    #[tokio::test]
    async fn duplicate_upstream_event_is_a_uniqueness_conflict() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let process = StoreBackedProcess::new("b", 0, store, EchoPolicy);
        let event = DecodedEvent {
            topic: "x".to_string(),
            state: serde_json::Value::Null,
        };

        let first = process
            .process_upstream_event(event.clone(), 1, "a")
            .await
            .unwrap();
        assert_eq!(first.new_events.len(), 1);

        let second = process.process_upstream_event(event, 1, "a").await;
        assert!(matches!(second, Err(RunnerError::UniquenessConflict { .. })));
    }

    #[tokio::test]
    async fn unsatisfied_causal_dependency_is_reported() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let process = StoreBackedProcess::new("c", 0, store, EchoPolicy);

        let deps = vec![CausalDependency {
            pipeline: 0,
            upstream_process: "a".to_string(),
            notification_id: 1,
        }];
        let err = process.check_causal_dependencies("a", &deps).await;
        assert!(matches!(
            err,
            Err(RunnerError::CausalDependencyUnsatisfied { .. })
        ));
    }

    #[tokio::test]
    async fn satisfied_causal_dependency_passes() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        // Record that "c" has already tracked notification 1 from "a".
        store
            .insert_tracking_and_append(0, "c", "a", 1, Vec::new())
            .await
            .unwrap();
        let process = StoreBackedProcess::new("c", 0, store, EchoPolicy);

        let deps = vec![CausalDependency {
            pipeline: 0,
            upstream_process: "a".to_string(),
            notification_id: 1,
        }];
        process.check_causal_dependencies("a", &deps).await.unwrap();
    }

    #[tokio::test]
    async fn emit_call_appends_and_fires_prompt_hook() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let process = StoreBackedProcess::new("a", 0, store, EchoPolicy);

        let last_prompt = Arc::new(AtomicI64::new(0));
        let recorder = last_prompt.clone();
        process
            .set_prompt_hook(Arc::new(move |head| {
                recorder.store(head, Ordering::SeqCst);
            }))
            .await;

        let args = serde_json::json!([
            {"topic": "created", "state": {"n": 1}},
            {"topic": "created", "state": {"n": 2}},
        ]);
        let result = process.call("emit", args).await.unwrap();
        let written: Vec<Notification> = serde_json::from_value(result).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(last_prompt.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn emit_rejects_unknown_method() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let process = StoreBackedProcess::new("a", 0, store, EchoPolicy);
        let err = process.call("not-a-method", serde_json::Value::Null).await;
        assert!(matches!(err, Err(RunnerError::Programming(_))));
    }
}
