//! `Runner`: the crate's public entry point. Builds one
//! [`crate::host::ProcessHost`] per `(process_name, pipeline_id)`, wires each
//! host's upstream/downstream handles from the [`System`] graph, brings every
//! host up, and tears them all down again on [`Runner::close`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::config::{RunnerConfig, CLOSE_TIMEOUT};
use crate::error::RunnerError;
use crate::host::{HostHandle, NotificationLogView, ProcessHost};
use crate::model::PipelineId;
use crate::store::RecordStore;
use crate::system::System;

/// A running instance of a [`System`], replicated across every configured
/// pipeline.
pub struct Runner {
    hosts: HashMap<(String, PipelineId), HostHandle>,
    started_at: DateTime<Utc>,
}

impl Runner {
    /// Validates the graph, builds a host per `(process, pipeline)`, wires
    /// the upstream/downstream handles every host needs, then `init`s them
    /// all.
    #[instrument(name = "runner.start", skip_all)]
    pub async fn start(
        system: System,
        config: RunnerConfig,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, RunnerError> {
        system.validate()?;

        let mut hosts = HashMap::new();
        for &pipeline in &config.pipeline_ids {
            for name in system.process_names() {
                let factory = system
                    .factory(&name)
                    .expect("validate() already confirmed every process has a factory");
                let process = factory(pipeline, store.clone());
                let host = ProcessHost::spawn(name.clone(), pipeline, config.clone(), store.clone(), process);
                hosts.insert((name, pipeline), host);
            }
        }

        for &pipeline in &config.pipeline_ids {
            for name in system.process_names() {
                let host = hosts
                    .get(&(name.clone(), pipeline))
                    .expect("just inserted above")
                    .clone();

                let mut upstream_handles = HashMap::new();
                for upstream in system.upstream_names(&name) {
                    let upstream_host = hosts
                        .get(&(upstream.clone(), pipeline))
                        .expect("every process name has a host per pipeline")
                        .clone();
                    upstream_handles.insert(upstream, NotificationLogView::new(upstream_host));
                }

                let mut downstream_handles = HashMap::new();
                for downstream in system.downstream_names(&name) {
                    let downstream_host = hosts
                        .get(&(downstream.clone(), pipeline))
                        .expect("every process name has a host per pipeline")
                        .clone();
                    downstream_handles.insert(downstream, downstream_host);
                }

                host.init(upstream_handles, downstream_handles).await?;
            }
        }

        let started_at = Utc::now();
        info!(%started_at, host_count = hosts.len(), "runner started");
        Ok(Self { hosts, started_at })
    }

    /// When [`Runner::start`] completed bringing every host up.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// `call(method_name, args…)`, routed to the host for
    /// `(process_name, pipeline)`.
    pub async fn call(
        &self,
        process_name: &str,
        pipeline: PipelineId,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RunnerError> {
        let host = self
            .hosts
            .get(&(process_name.to_string(), pipeline))
            .ok_or_else(|| {
                RunnerError::Programming(format!(
                    "no host for process '{process_name}' in pipeline {pipeline}"
                ))
            })?;
        host.call(method, args).await
    }

    /// Forces the host for `(process_name, pipeline)` to nudge its
    /// downstreams, resolving the current head itself rather than waiting
    /// for that process's next commit. Useful for an operator who wants
    /// every downstream to catch up immediately, independent of new traffic.
    pub async fn nudge(&self, process_name: &str, pipeline: PipelineId) -> Result<(), RunnerError> {
        let host = self
            .hosts
            .get(&(process_name.to_string(), pipeline))
            .ok_or_else(|| {
                RunnerError::Programming(format!(
                    "no host for process '{process_name}' in pipeline {pipeline}"
                ))
            })?;
        host.nudge_downstreams().await;
        Ok(())
    }

    /// Stop every host, bounded by [`CLOSE_TIMEOUT`] so
    /// one unresponsive host can't hang shutdown indefinitely.
    #[instrument(name = "runner.close", skip_all)]
    pub async fn close(&self) {
        let hosts: Vec<HostHandle> = self.hosts.values().cloned().collect();
        let shutdown = futures::future::join_all(hosts.iter().map(|host| host.stop()));
        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            warn!("runner close timed out waiting for hosts to stop");
        }
    }
}
