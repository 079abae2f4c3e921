//! Record store: the event-store/tracking-table boundary.
//!
//! Out of scope for this crate are the concrete database driver, connection
//! pooling, table setup, and configuration loading. What remains in scope
//! is the *contract*: append, half-open notification range reads, max-id
//! queries, and a tracking insert that commits atomically with the new
//! events it produced. [`InMemoryRecordStore`] is the one implementation
//! shipped here, sufficient to run the full integration test suite and to
//! stand in for a real backend in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CausalDependency, NewEvent, Notification, PipelineId, TrackingRecord};

/// Errors surfaced by a [`RecordStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Operational(String),

    #[error("unknown process application: {0}")]
    UnknownProcess(String),
}

impl StoreError {
    pub fn is_operational(&self) -> bool {
        matches!(self, StoreError::Operational(_))
    }
}

/// Outcome of the atomic "insert tracking row + append new events" write
/// `process_upstream_event` requires.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// The tracking row was new; `new_events` were appended in the same
    /// transaction and are now visible to downstreams.
    Applied {
        new_events: Vec<Notification>,
        new_records: Vec<TrackingRecord>,
    },
    /// A tracking row for this `(downstream, upstream, pipeline, notification)`
    /// already existed. The whole transaction aborted; nothing was written.
    DuplicateTracking,
}

/// The event-store + tracking-table contract consumed by the runner core.
///
/// Every operation is scoped to a `pipeline_id`; pipelines never observe
/// each other's notifications or tracking rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append notifications for `process` in `pipeline`, assigning each the
    /// next contiguous id. Returns the stored notifications (with ids
    /// filled in) in append order.
    async fn append(
        &self,
        pipeline: PipelineId,
        process: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Half-open range `[first, last)`; `None` on either side is unbounded
    /// on that side.
    async fn get_notifications(
        &self,
        pipeline: PipelineId,
        process: &str,
        first: Option<i64>,
        last: Option<i64>,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Current max notification id for `process` in `pipeline`, or 0 if none.
    async fn get_max_notification_id(
        &self,
        pipeline: PipelineId,
        process: &str,
    ) -> Result<i64, StoreError>;

    /// Atomically: insert a tracking row for
    /// `(downstream, upstream, pipeline, notification_id)`, then append
    /// `new_events` for `downstream`. If the tracking row already exists the
    /// whole write aborts and [`AppendOutcome::DuplicateTracking`] is
    /// returned.
    async fn insert_tracking_and_append(
        &self,
        pipeline: PipelineId,
        downstream: &str,
        upstream: &str,
        notification_id: i64,
        new_events: Vec<NewEvent>,
    ) -> Result<AppendOutcome, StoreError>;

    /// Highest tracked notification id for `(downstream, upstream, pipeline)`,
    /// or `None` if nothing has been tracked yet.
    async fn max_tracking_for_upstream(
        &self,
        pipeline: PipelineId,
        downstream: &str,
        upstream: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Whether `(pipeline, downstream, upstream, notification_id)` has been
    /// satisfied — used by `check_causal_dependencies`.
    async fn has_tracking(
        &self,
        pipeline: PipelineId,
        downstream: &str,
        upstream: &str,
        notification_id: i64,
    ) -> Result<bool, StoreError>;
}

/// Checks a batch of causal dependencies against the tracking table,
/// returning the first unsatisfied one. This is the piece of
/// `check_causal_dependencies` that is independent of any particular
/// process application's policy, so it lives on the store rather than
/// being reimplemented by every [`crate::process::ProcessApplication`].
pub async fn first_unsatisfied_dependency(
    store: &dyn RecordStore,
    pipeline: PipelineId,
    downstream: &str,
    deps: &[CausalDependency],
) -> Result<Option<CausalDependency>, StoreError> {
    for dep in deps {
        let satisfied = store
            .has_tracking(pipeline, downstream, &dep.upstream_process, dep.notification_id)
            .await?;
        if !satisfied {
            return Ok(Some(dep.clone()));
        }
    }
    Ok(None)
}

#[derive(Default)]
struct ProcessLog {
    notifications: Vec<Notification>,
}

#[derive(Default)]
struct PipelineState {
    logs: HashMap<String, ProcessLog>,
    tracking: HashMap<(String, String), Vec<i64>>,
}

/// A process-partitioned, pipeline-partitioned, in-memory [`RecordStore`].
///
/// Guarded by a single `Mutex` — the simplest thing that satisfies "serial
/// access to the record manager" for a reference implementation; a real
/// backend would use one serializable transaction per write instead of a
/// process-wide lock.
pub struct InMemoryRecordStore {
    state: Mutex<HashMap<PipelineId, PipelineState>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn append(
        &self,
        pipeline: PipelineId,
        process: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut guard = self.state.lock().unwrap();
        let pipeline_state = guard.entry(pipeline).or_default();
        let log = pipeline_state.logs.entry(process.to_string()).or_default();
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            let id = log.notifications.len() as i64 + 1;
            let notification = Notification {
                id,
                topic: event.topic,
                state: event.state,
                causal_dependencies: event.causal_dependencies,
                is_notifiable: event.is_notifiable,
            };
            log.notifications.push(notification.clone());
            appended.push(notification);
        }
        Ok(appended)
    }

    async fn get_notifications(
        &self,
        pipeline: PipelineId,
        process: &str,
        first: Option<i64>,
        last: Option<i64>,
    ) -> Result<Vec<Notification>, StoreError> {
        let guard = self.state.lock().unwrap();
        let Some(pipeline_state) = guard.get(&pipeline) else {
            return Ok(Vec::new());
        };
        let Some(log) = pipeline_state.logs.get(process) else {
            return Ok(Vec::new());
        };
        let first = first.unwrap_or(1);
        Ok(log
            .notifications
            .iter()
            .filter(|n| n.id >= first && last.map(|l| n.id < l).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_max_notification_id(
        &self,
        pipeline: PipelineId,
        process: &str,
    ) -> Result<i64, StoreError> {
        let guard = self.state.lock().unwrap();
        Ok(guard
            .get(&pipeline)
            .and_then(|p| p.logs.get(process))
            .and_then(|log| log.notifications.last())
            .map(|n| n.id)
            .unwrap_or(0))
    }

    async fn insert_tracking_and_append(
        &self,
        pipeline: PipelineId,
        downstream: &str,
        upstream: &str,
        notification_id: i64,
        new_events: Vec<NewEvent>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut guard = self.state.lock().unwrap();
        let pipeline_state = guard.entry(pipeline).or_default();
        let key = (downstream.to_string(), upstream.to_string());
        let tracked = pipeline_state.tracking.entry(key).or_default();
        if tracked.contains(&notification_id) {
            return Ok(AppendOutcome::DuplicateTracking);
        }
        tracked.push(notification_id);
        tracked.sort_unstable();

        let log = pipeline_state
            .logs
            .entry(downstream.to_string())
            .or_default();
        let mut appended = Vec::with_capacity(new_events.len());
        for event in new_events {
            let id = log.notifications.len() as i64 + 1;
            let notification = Notification {
                id,
                topic: event.topic,
                state: event.state,
                causal_dependencies: event.causal_dependencies,
                is_notifiable: event.is_notifiable,
            };
            log.notifications.push(notification.clone());
            appended.push(notification);
        }
        let new_records = vec![TrackingRecord {
            downstream_process: downstream.to_string(),
            upstream_process: upstream.to_string(),
            pipeline_id: pipeline,
            notification_id,
        }];
        Ok(AppendOutcome::Applied {
            new_events: appended,
            new_records,
        })
    }

    async fn max_tracking_for_upstream(
        &self,
        pipeline: PipelineId,
        downstream: &str,
        upstream: &str,
    ) -> Result<Option<i64>, StoreError> {
        let guard = self.state.lock().unwrap();
        Ok(guard.get(&pipeline).and_then(|p| {
            p.tracking
                .get(&(downstream.to_string(), upstream.to_string()))
                .and_then(|v| v.last().copied())
        }))
    }

    async fn has_tracking(
        &self,
        pipeline: PipelineId,
        downstream: &str,
        upstream: &str,
        notification_id: i64,
    ) -> Result<bool, StoreError> {
        let guard = self.state.lock().unwrap();
        Ok(guard
            .get(&pipeline)
            .and_then(|p| p.tracking.get(&(downstream.to_string(), upstream.to_string())))
            .map(|v| v.contains(&notification_id))
            .unwrap_or(false))
    }
}
