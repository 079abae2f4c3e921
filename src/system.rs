//! `System`: the static directed graph `G = (P, E)` of process applications
//! and their "follows" relation. `P` and `E` are independent — a process
//! with no upstream and no downstream is still a valid member of the
//! graph — so the node set is tracked explicitly rather than derived from
//! edges alone.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::RunnerError;
use crate::model::PipelineId;
use crate::process::ProcessApplication;
use crate::store::RecordStore;

/// Builds a process application for a given `(pipeline, store)` — the
/// concrete infrastructure binding every process class needs before
/// `Runner::start` will proceed.
pub type ProcessFactory =
    Arc<dyn Fn(PipelineId, Arc<dyn RecordStore>) -> Arc<dyn ProcessApplication> + Send + Sync>;

/// A directed graph of named process applications plus, for each, the
/// factory that constructs its runtime instance. `b follows a` is recorded
/// as the edge `(a, b)`: `a` is upstream of `b`.
#[derive(Clone)]
pub struct System {
    nodes: BTreeSet<String>,
    edges: Vec<(String, String)>,
    factories: HashMap<String, ProcessFactory>,
}

impl System {
    /// Builds a system from `(upstream, downstream)` edges. Both endpoints
    /// of every edge are registered as nodes automatically; a process with
    /// no follows relation at all still needs [`System::with_process`] (or
    /// [`System::with_factory`], which also registers the node) to appear
    /// in the graph.
    pub fn new<I, S>(edges: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let edges: Vec<(String, String)> = edges
            .into_iter()
            .map(|(a, b)| (a.into(), b.into()))
            .collect();
        let mut nodes = BTreeSet::new();
        for (a, b) in &edges {
            nodes.insert(a.clone());
            nodes.insert(b.clone());
        }
        Self {
            nodes,
            edges,
            factories: HashMap::new(),
        }
    }

    /// Registers a process with no follows relation of its own — an
    /// isolated node in the graph. A no-op if the name is already present
    /// (e.g. as an edge endpoint).
    pub fn with_process(mut self, process_name: impl Into<String>) -> Self {
        self.nodes.insert(process_name.into());
        self
    }

    /// Registers the infrastructure binding for `process_name`, also adding
    /// it as a node if it wasn't already one.
    pub fn with_factory(mut self, process_name: impl Into<String>, factory: ProcessFactory) -> Self {
        let process_name = process_name.into();
        self.nodes.insert(process_name.clone());
        self.factories.insert(process_name, factory);
        self
    }

    /// Every process name in the graph, whether or not it has any edges.
    pub fn process_names(&self) -> BTreeSet<String> {
        self.nodes.clone()
    }

    pub fn upstream_names(&self, process: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, b)| b == process)
            .map(|(a, _)| a.clone())
            .collect()
    }

    pub fn downstream_names(&self, process: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(a, _)| a == process)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn factory(&self, process: &str) -> Option<&ProcessFactory> {
        self.factories.get(process)
    }

    /// Every process in the graph must have a concrete infrastructure
    /// binding before a `Runner` can start it. Raised as a programming
    /// error, never retried.
    pub fn validate(&self) -> Result<(), RunnerError> {
        for name in self.process_names() {
            if !self.factories.contains_key(&name) {
                return Err(RunnerError::Programming(format!(
                    "process '{name}' has no infrastructure binding (no factory registered)"
                )));
            }
        }
        Ok(())
    }
}
