//! Runner configuration.
//!
//! Mirrors the framework's usual configuration shape: a plain struct with a
//! `Default` impl and `serde::Deserialize` for optional file loading,
//! environment-variable overrides applied on top (the `DB_URI` override is
//! handled in [`RunnerConfig::resolve_db_uri`]).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;
use crate::model::PipelineId;

/// Environment variable overriding/configuring the record store when
/// `db_uri` is left unset.
pub const DB_URI_ENV_VAR: &str = "DB_URI";

/// Number of notifications the Puller fetches per upstream per round before
/// re-arming itself to check for more.
pub const DEFAULT_RANGE_LIMIT: i64 = 10;

/// Bounded retry applied to operational errors at the `call` /
/// `get_notifications` boundary: 10 attempts, 100ms apart.
pub const DEFAULT_OPERATIONAL_RETRY_ATTEMPTS: usize = 10;
pub const DEFAULT_OPERATIONAL_RETRY_DELAY_MS: u64 = 100;

/// Cap on the Puller's per-round request rate.
pub const PULLER_CYCLE_DELAY_MS: u64 = 150;

/// Bounded timeout `Runner::close` applies before abandoning a
/// non-responding host.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Independent lanes replicating the process graph. Defaults to a
    /// single pipeline, id 0.
    pub pipeline_ids: Vec<PipelineId>,

    /// Periodic fallback: even with no prompt, a Puller re-checks each
    /// upstream at least this often, bounding the cost of a lost prompt.
    #[serde(with = "humantime_secs")]
    pub poll_interval: Duration,

    /// Whether the (external) record store should create its tables on
    /// startup. The runner core never touches schema itself; this is
    /// forwarded to the store for implementations that need it.
    pub setup_tables: bool,

    /// Record store connection string. Falls back to `DB_URI` if unset.
    pub db_uri: Option<String>,

    /// Notifications fetched per upstream per Puller round.
    pub range_limit: i64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pipeline_ids: vec![0],
            poll_interval: Duration::from_secs(5),
            setup_tables: false,
            db_uri: None,
            range_limit: DEFAULT_RANGE_LIMIT,
        }
    }
}

impl RunnerConfig {
    /// `db_uri` if set, else the `DB_URI` environment variable, else `None`.
    pub fn resolve_db_uri(&self) -> Option<String> {
        self.db_uri
            .clone()
            .or_else(|| std::env::var(DB_URI_ENV_VAR).ok())
    }

    /// Loads configuration layered default < file < `ANGZARR__*` environment
    /// variables, the framework's usual precedence for binaries embedding
    /// this crate. `path` is optional and silently skipped if missing.
    pub fn load(path: Option<&Path>) -> Result<Self, RunnerError> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&RunnerConfig::default())
                .map_err(|e| RunnerError::Programming(format!("default config: {e}")))?,
        );
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(false));
        }
        builder = builder.add_source(Environment::with_prefix("ANGZARR").separator("__"));

        let built = builder
            .build()
            .map_err(|e| RunnerError::Programming(format!("loading config: {e}")))?;
        built
            .try_deserialize()
            .map_err(|e| RunnerError::Programming(format!("parsing config: {e}")))
    }

    /// Renders the resolved configuration as YAML, for startup diagnostics.
    pub fn to_yaml(&self) -> Result<String, RunnerError> {
        serde_yaml::to_string(self).map_err(|e| RunnerError::Programming(e.to_string()))
    }
}

mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
