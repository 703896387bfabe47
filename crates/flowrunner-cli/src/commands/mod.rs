//! CLI command definitions, shared configuration flags, and dispatch.

pub mod scheduler;
pub mod server;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use flowrunner_core::config::TelemetryConfig;
use flowrunner_core::telemetry::{self, ServiceRole, Telemetry};
use flowrunner_core::{
    ClientCredential, Config, FsObjectStore, MemoryTaskStore, ObjectStore, RedisBus,
    RedisTaskStore, StreamBus, TaskStore,
};

/// flowrunner CLI — the agent-flow task execution service.
#[derive(Parser)]
#[command(
    name = "flowrunner",
    version,
    about = "Run agent flows as isolated, streamed tasks",
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP + WebSocket endpoint and a worker set.
    Server(server::ServerArgs),

    /// Start workers only (pull tasks from the shared queue).
    Worker(worker::WorkerArgs),

    /// Run the periodic reconciler (orphan reaping, retention).
    Scheduler(scheduler::SchedulerArgs),
}

/// Startup failures map to the documented exit codes: 1 for configuration
/// errors, 2 for unreachable infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("infrastructure unreachable: {0}")]
    Infrastructure(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::Infrastructure(_) => 2,
            StartupError::Other(_) => 1,
        }
    }
}

/// Configuration flags shared by all subcommands. Every flag falls back to
/// an environment variable under the `FLOWRUNNER_` prefix.
#[derive(Args, Clone)]
pub struct ConfigArgs {
    /// Listen address for the HTTP + WebSocket endpoint.
    #[arg(long, env = "FLOWRUNNER_LISTEN_ADDR", default_value = "0.0.0.0:8765")]
    pub listen_addr: String,

    /// Stream backend URL.
    #[arg(long, env = "FLOWRUNNER_BUS_URL", default_value = "redis://127.0.0.1:6379/0")]
    pub bus_url: String,

    /// Persistence URL. Omit to use the in-memory store (single node,
    /// non-durable).
    #[arg(long, env = "FLOWRUNNER_STORE_URL")]
    pub store_url: Option<String>,

    /// Object storage root directory.
    #[arg(long, env = "FLOWRUNNER_STORAGE_DIR", default_value = "./flowrunner-data")]
    pub storage_dir: PathBuf,

    /// Worker set size (1..=100).
    #[arg(long, env = "FLOWRUNNER_MAX_JOBS", default_value_t = 4)]
    pub max_jobs: usize,

    /// Per-client active-task limit.
    #[arg(long, env = "FLOWRUNNER_CLIENT_TASK_LIMIT", default_value_t = 3)]
    pub client_task_limit: usize,

    /// Default input timeout in seconds.
    #[arg(long, env = "FLOWRUNNER_INPUT_TIMEOUT", default_value_t = 180)]
    pub input_timeout: u64,

    /// Default maximum task duration in seconds (0 = unbounded).
    #[arg(long, env = "FLOWRUNNER_MAX_TASK_DURATION", default_value_t = 0)]
    pub max_task_duration: u64,

    /// Days per-task streams and soft-deleted records are retained.
    #[arg(long, env = "FLOWRUNNER_TASK_RETENTION_DAYS", default_value_t = 7)]
    pub retention_days: u32,

    /// Seconds between SIGTERM and SIGKILL during cancellation.
    #[arg(long, env = "FLOWRUNNER_GRACE_PERIOD", default_value_t = 10)]
    pub grace_period: u64,

    /// Command used to execute a flow file.
    #[arg(long, env = "FLOWRUNNER_AGENT_CMD", default_value = "flowrunner-agent")]
    pub agent_cmd: String,

    /// Registered client credentials: comma-separated id:secret pairs.
    #[arg(long, env = "FLOWRUNNER_API_KEYS", default_value = "", hide_env_values = true)]
    pub api_keys: String,

    /// Comma-separated trusted origins for CORS and WebSocket (empty =
    /// any origin).
    #[arg(long, env = "FLOWRUNNER_TRUSTED_ORIGINS", default_value = "")]
    pub trusted_origins: String,

    /// Maximum flow file size in bytes.
    #[arg(long, env = "FLOWRUNNER_MAX_FLOW_SIZE", default_value_t = 5 * 1024 * 1024)]
    pub max_flow_size: u64,

    /// Export traces over OTLP.
    #[arg(long, env = "FLOWRUNNER_TELEMETRY", default_value_t = false)]
    pub telemetry: bool,

    /// OTLP exporter endpoint.
    #[arg(long, env = "FLOWRUNNER_OTLP_ENDPOINT", default_value = "http://localhost:4317")]
    pub otlp_endpoint: String,
}

impl ConfigArgs {
    pub fn into_config(self) -> Result<Config, StartupError> {
        let api_keys = if self.api_keys.trim().is_empty() {
            Vec::new()
        } else {
            ClientCredential::parse_list(&self.api_keys)
                .map_err(|e| StartupError::Config(e.to_string()))?
        };
        let trusted_origins = self
            .trusted_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let config = Config {
            listen_addr: self.listen_addr,
            bus_url: self.bus_url,
            store_url: self.store_url,
            storage_dir: self.storage_dir,
            max_jobs: self.max_jobs,
            client_task_limit: self.client_task_limit,
            input_timeout: self.input_timeout,
            max_task_duration: self.max_task_duration,
            retention_days: self.retention_days,
            grace_period: self.grace_period,
            drain_window_ms: 2_000,
            agent_cmd: self.agent_cmd,
            api_keys,
            trusted_origins,
            max_flow_size: self.max_flow_size,
            telemetry: TelemetryConfig {
                enabled: self.telemetry,
                otlp_endpoint: self.otlp_endpoint,
            },
        };
        config
            .validate()
            .map_err(|e| StartupError::Config(e.to_string()))?;
        Ok(config)
    }
}

/// Shared service handles built once per process. Holds the telemetry
/// guard so pending spans flush on exit.
pub struct Runtime {
    pub config: Arc<Config>,
    pub bus: Arc<dyn StreamBus>,
    pub store: Arc<dyn TaskStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub telemetry: Telemetry,
}

/// Initialize telemetry and connect the collaborators. Unreachable
/// backends at startup map to exit code 2.
pub async fn bootstrap(config: Config, role: ServiceRole) -> Result<Runtime, StartupError> {
    let telemetry = telemetry::init(&config.telemetry, role)?;

    let bus = RedisBus::connect(&config.bus_url)
        .await
        .map_err(|e| StartupError::Infrastructure(e.to_string()))?;
    bus.ping()
        .await
        .map_err(|e| StartupError::Infrastructure(e.to_string()))?;

    let store: Arc<dyn TaskStore> = match &config.store_url {
        Some(url) => Arc::new(
            RedisTaskStore::connect(url)
                .await
                .map_err(|e| StartupError::Infrastructure(e.to_string()))?,
        ),
        None => {
            tracing::warn!("no persistence URL configured; task records are in-memory");
            Arc::new(MemoryTaskStore::new())
        }
    };

    let storage: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.storage_dir));

    Ok(Runtime {
        config: Arc::new(config),
        bus: Arc::new(bus),
        store,
        storage,
        telemetry,
    })
}

/// Shutdown broadcast flipped on SIGINT/SIGTERM.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Execute the CLI command.
pub async fn execute(cli: Cli) -> Result<(), StartupError> {
    match cli.command {
        Commands::Server(args) => server::execute(args).await,
        Commands::Worker(args) => worker::execute(args).await,
        Commands::Scheduler(args) => scheduler::execute(args).await,
    }
}
