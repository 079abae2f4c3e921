//! Error taxonomy for the runner.
//!
//! Four kinds: a programming error (graph misconfiguration, calling `call`
//! before `init`) is raised straight to the caller and never retried; an
//! operational error (transient store/transport failure) is retried at the
//! `call`/`get_notifications` boundary (see [`crate::utils::retry`]); a
//! uniqueness conflict on the tracking insert means "already processed" and
//! is swallowed by the `EventProcessor`; a causal-dependency failure
//! triggers a local reset and is not otherwise surfaced.

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised by the runner's public surface and internal workers.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Graph misconfiguration or API misuse (e.g. `call` before `init`,
    /// a process with no bound infrastructure). Never retried.
    #[error("programming error: {0}")]
    Programming(String),

    /// Transient failure talking to the record store or to another host.
    /// Retried with bounded backoff at the call boundary.
    #[error("operational error: {0}")]
    Operational(String),

    /// The tracking insert for `(downstream, upstream, pipeline, notification)`
    /// hit the unique constraint: this notification was already processed.
    #[error("uniqueness conflict: {downstream} already tracked {upstream}#{notification_id} in pipeline {pipeline_id}")]
    UniquenessConflict {
        downstream: String,
        upstream: String,
        pipeline_id: u32,
        notification_id: i64,
    },

    /// `check_causal_dependencies` found a dependency that has not yet been
    /// observed locally. The caller should reset and wait for a prompt.
    #[error("causal dependency unsatisfied: {upstream} notification depends on pipeline {dep_pipeline} notification {dep_notification}, not yet processed")]
    CausalDependencyUnsatisfied {
        upstream: String,
        dep_pipeline: u32,
        dep_notification: i64,
    },

    /// Propagated from the record store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunnerError {
    /// True for transient failures that are worth retrying.
    pub fn is_operational(&self) -> bool {
        matches!(self, RunnerError::Operational(_))
            || matches!(self, RunnerError::Store(e) if e.is_operational())
    }

    pub fn is_uniqueness_conflict(&self) -> bool {
        matches!(self, RunnerError::UniquenessConflict { .. })
    }

    pub fn is_causal_dependency_unsatisfied(&self) -> bool {
        matches!(self, RunnerError::CausalDependencyUnsatisfied { .. })
    }
}
