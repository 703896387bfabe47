//! `flowrunner server` — the HTTP + WebSocket endpoint plus a worker set.

use std::sync::Arc;

use clap::Args;

use flowrunner_core::telemetry::ServiceRole;
use flowrunner_core::{
    AllowAll, AuthVerifier, Scheduler, StaticTokenVerifier, TaskRunner, WorkerPool,
};

use super::{bootstrap, shutdown_signal, ConfigArgs, StartupError};
use crate::api::{self, AppState};

#[derive(Args)]
pub struct ServerArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn execute(args: ServerArgs) -> Result<(), StartupError> {
    let config = args.config.into_config()?;
    let rt = bootstrap(config, ServiceRole::Server).await?;
    let config = Arc::clone(&rt.config);

    if config.api_keys.is_empty() {
        tracing::warn!("no API keys configured; every request will be rejected");
    }

    let verifier: Arc<dyn AuthVerifier> =
        Arc::new(StaticTokenVerifier::from_credentials(&config.api_keys));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&rt.bus),
        Arc::clone(&rt.store),
        Arc::clone(&rt.storage),
        Arc::new(AllowAll),
        Arc::clone(&config),
    ));

    let shutdown = shutdown_signal();

    // The worker set shares the process with the HTTP surface.
    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&rt.bus),
        Arc::clone(&rt.store),
        Arc::clone(&rt.storage),
        Arc::clone(&config),
    ));
    let pool = WorkerPool::new(runner, shutdown.clone());
    let max_jobs = config.max_jobs;
    let workers = tokio::spawn(async move { pool.run(max_jobs).await });

    let state = AppState {
        scheduler,
        store: Arc::clone(&rt.store),
        storage: Arc::clone(&rt.storage),
        bus: Arc::clone(&rt.bus),
        verifier,
        config: Arc::clone(&config),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| StartupError::Config(format!("bind {}: {e}", config.listen_addr)))?;
    tracing::info!(addr = %config.listen_addr, workers = max_jobs, "flowrunner server started");

    let mut shutdown_http = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_http.changed().await;
        })
        .await
        .map_err(|e| StartupError::Other(anyhow::anyhow!("http server: {e}")))?;

    let _ = workers.await;
    tracing::info!("flowrunner server stopped");
    Ok(())
}
