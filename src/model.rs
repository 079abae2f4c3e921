//! Data model: notifications, tracking records, prompts, positions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `pipeline_id`: an independent lane replicating the process graph. Lanes
/// share the record store but never in-memory state.
pub type PipelineId = u32;

/// Monotonic, contiguous per `(process, pipeline)`.
pub type NotificationId = i64;

/// A dependency a notification declares on an upstream notification in some
/// pipeline — `check_causal_dependencies` verifies these against the
/// tracking table before a notification may be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalDependency {
    pub pipeline: PipelineId,
    pub upstream_process: String,
    pub notification_id: NotificationId,
}

/// An immutable, numbered record of one event, readable by downstream
/// processes. `state` is an opaque payload; this crate never interprets it —
/// domain-event serialization and business policy belong to the process
/// application, not the runner core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub topic: String,
    pub state: serde_json::Value,
    pub causal_dependencies: Vec<CausalDependency>,
    /// Whether this event should trigger a prompt to downstreams once
    /// committed.
    pub is_notifiable: bool,
}

/// An event not yet assigned an id — what a process application produces;
/// the store assigns `id` on append.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub topic: String,
    pub state: serde_json::Value,
    pub causal_dependencies: Vec<CausalDependency>,
    pub is_notifiable: bool,
}

impl NewEvent {
    pub fn new(topic: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            state,
            causal_dependencies: Vec::new(),
            is_notifiable: true,
        }
    }

    pub fn with_causal_dependencies(mut self, deps: Vec<CausalDependency>) -> Self {
        self.causal_dependencies = deps;
        self
    }

    pub fn notifiable(mut self, value: bool) -> Self {
        self.is_notifiable = value;
        self
    }
}

/// `(downstream_process, upstream_process, pipeline_id, notification_id)`,
/// persisted in the same transaction as the new events it enables. The sole
/// source of truth for "processed up to N for U".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRecord {
    pub downstream_process: String,
    pub upstream_process: String,
    pub pipeline_id: PipelineId,
    pub notification_id: NotificationId,
}

/// Advisory notice "new notifications are available up to `head`, or at
/// least *some* are available if `head` is unknown". Correctness never
/// depends on a prompt's delivery, only on latency.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub sender: String,
    pub pipeline: PipelineId,
    pub head: Option<NotificationId>,
}

impl Prompt {
    pub fn with_head(sender: impl Into<String>, pipeline: PipelineId, head: NotificationId) -> Self {
        Self {
            sender: sender.into(),
            pipeline,
            head: Some(head),
        }
    }

    /// A "pull" shell with no known head — used to nudge downstreams to
    /// catch up without waiting on this process's next commit; the
    /// Promoter resolves the head itself before forwarding.
    pub fn headless(sender: impl Into<String>, pipeline: PipelineId) -> Self {
        Self {
            sender: sender.into(),
            pipeline,
            head: None,
        }
    }
}

/// Per-host mapping `upstream_name -> latest head_id` received via prompts.
/// Monotonic non-decreasing per key; may lag reality arbitrarily.
#[derive(Debug, Default, Clone)]
pub struct HeadsMap(HashMap<String, NotificationId>);

impl HeadsMap {
    pub fn get(&self, upstream: &str) -> Option<NotificationId> {
        self.0.get(upstream).copied()
    }

    /// Applies `heads[sender] = max(heads.get(sender), new_head)`.
    /// Returns `true` if the stored value changed or was previously absent.
    pub fn merge(&mut self, sender: &str, new_head: NotificationId) -> bool {
        match self.0.get(sender) {
            Some(&current) if current >= new_head => false,
            _ => {
                self.0.insert(sender.to_string(), new_head);
                true
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<String, NotificationId> {
        self.0.clone()
    }
}

/// Per-host mapping `upstream_name -> last processed notification_id`.
#[derive(Debug, Default, Clone)]
pub struct PositionsMap(HashMap<String, NotificationId>);

impl PositionsMap {
    pub fn get(&self, upstream: &str) -> NotificationId {
        self.0.get(upstream).copied().unwrap_or(0)
    }

    /// Advances `positions[upstream]` to `candidate`, but only forward.
    pub fn advance(&mut self, upstream: &str, candidate: NotificationId) {
        let entry = self.0.entry(upstream.to_string()).or_insert(0);
        if candidate > *entry {
            *entry = candidate;
        }
    }

    /// Unconditionally sets the position — used when re-deriving from the
    /// tracking table during a reset, where regression is expected and
    /// correct: the tracking table is authoritative, so a Puller that
    /// re-requests an already-seen range is wasteful but never wrong.
    pub fn set(&mut self, upstream: &str, value: NotificationId) {
        self.0.insert(upstream.to_string(), value);
    }
}
