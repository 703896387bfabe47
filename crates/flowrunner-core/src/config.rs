//! Configuration for the flowrunner service.
//!
//! Every option maps to an environment variable under the single
//! `FLOWRUNNER_` prefix; the CLI layer wires those through clap's env
//! fallbacks into this struct.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use flowrunner_proto::{RunnerError, RunnerResult};

use crate::auth::ClientCredential;

/// Runtime configuration shared by the server, workers, and reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP + WebSocket endpoint binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Stream backend URL.
    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    /// Persistence URL. `None` selects the in-memory store (single-node,
    /// non-durable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,

    /// Root directory of the object storage backend.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Size of the worker set; one task per worker at a time (1..=100).
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Per-client active-task quota.
    #[serde(default = "default_client_task_limit")]
    pub client_task_limit: usize,

    /// Default seconds an outstanding prompt waits before the default
    /// answer is synthesized.
    #[serde(default = "default_input_timeout")]
    pub input_timeout: u64,

    /// Default maximum task runtime in seconds. `0` disables the bound.
    #[serde(default)]
    pub max_task_duration: u64,

    /// Days per-task streams and soft-deleted records are retained after a
    /// terminal transition.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds between SIGTERM and SIGKILL during cancellation.
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,

    /// Milliseconds the result collector keeps draining child output after
    /// exit.
    #[serde(default = "default_drain_window_ms")]
    pub drain_window_ms: u64,

    /// Command used to execute a flow file; the file name is appended as
    /// the final argument.
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,

    /// Registered client credentials (`id:secret` pairs).
    #[serde(default)]
    pub api_keys: Vec<ClientCredential>,

    /// Origins allowed by CORS and WebSocket handshakes. Empty = any.
    #[serde(default)]
    pub trusted_origins: Vec<String>,

    /// Maximum accepted flow file size in bytes.
    #[serde(default = "default_max_flow_size")]
    pub max_flow_size: u64,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bus_url: default_bus_url(),
            store_url: None,
            storage_dir: default_storage_dir(),
            max_jobs: default_max_jobs(),
            client_task_limit: default_client_task_limit(),
            input_timeout: default_input_timeout(),
            max_task_duration: 0,
            retention_days: default_retention_days(),
            grace_period: default_grace_period(),
            drain_window_ms: default_drain_window_ms(),
            agent_cmd: default_agent_cmd(),
            api_keys: Vec::new(),
            trusted_origins: Vec::new(),
            max_flow_size: default_max_flow_size(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Validate option ranges and URL shapes.
    pub fn validate(&self) -> RunnerResult<()> {
        if !(1..=100).contains(&self.max_jobs) {
            return Err(RunnerError::ValidationFailed(format!(
                "max_jobs must be within 1..=100, got {}",
                self.max_jobs
            )));
        }
        if self.client_task_limit == 0 {
            return Err(RunnerError::ValidationFailed(
                "client task limit must be at least 1".into(),
            ));
        }
        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            RunnerError::ValidationFailed(format!("listen address {:?}: {e}", self.listen_addr))
        })?;
        let bus = Url::parse(&self.bus_url).map_err(|e| {
            RunnerError::ValidationFailed(format!("stream backend URL {:?}: {e}", self.bus_url))
        })?;
        if !matches!(bus.scheme(), "redis" | "rediss" | "redis+unix") {
            return Err(RunnerError::ValidationFailed(format!(
                "unsupported stream backend scheme {:?}",
                bus.scheme()
            )));
        }
        if let Some(store) = &self.store_url {
            Url::parse(store).map_err(|e| {
                RunnerError::ValidationFailed(format!("persistence URL {store:?}: {e}"))
            })?;
        }
        Ok(())
    }

    /// The grace window between SIGTERM and SIGKILL.
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }

    /// The post-exit drain window.
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8765".into()
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379/0".into()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./flowrunner-data")
}

fn default_max_jobs() -> usize {
    4
}

fn default_client_task_limit() -> usize {
    3
}

fn default_input_timeout() -> u64 {
    180
}

fn default_retention_days() -> u32 {
    7
}

fn default_grace_period() -> u64 {
    10
}

fn default_drain_window_ms() -> u64 {
    2_000
}

fn default_agent_cmd() -> String {
    "flowrunner-agent".into()
}

fn default_max_flow_size() -> u64 {
    5 * 1024 * 1024
}

/// Telemetry/observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether to export traces over OTLP.
    #[serde(default)]
    pub enabled: bool,

    /// OTLP exporter endpoint.
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_max_jobs_bounds() {
        let mut config = Config::default();
        config.max_jobs = 0;
        assert!(config.validate().is_err());
        config.max_jobs = 101;
        assert!(config.validate().is_err());
        config.max_jobs = 100;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_non_redis_bus() {
        let mut config = Config::default();
        config.bus_url = "http://127.0.0.1:6379".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_listen_addr() {
        let mut config = Config::default();
        config.listen_addr = "not-an-addr".into();
        assert!(config.validate().is_err());
    }
}
