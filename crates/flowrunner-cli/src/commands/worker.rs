//! `flowrunner worker` — workers only, pulling from the shared queue.

use std::sync::Arc;

use clap::Args;

use flowrunner_core::telemetry::ServiceRole;
use flowrunner_core::{TaskRunner, WorkerPool};

use super::{bootstrap, shutdown_signal, ConfigArgs, StartupError};

#[derive(Args)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn execute(args: WorkerArgs) -> Result<(), StartupError> {
    let config = args.config.into_config()?;
    if config.store_url.is_none() {
        tracing::warn!(
            "standalone workers with the in-memory store cannot see the server's task records; \
             set FLOWRUNNER_STORE_URL"
        );
    }
    let rt = bootstrap(config, ServiceRole::Worker).await?;

    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&rt.bus),
        Arc::clone(&rt.store),
        Arc::clone(&rt.storage),
        Arc::clone(&rt.config),
    ));
    let shutdown = shutdown_signal();
    let pool = WorkerPool::new(runner, shutdown);

    tracing::info!(workers = rt.config.max_jobs, "flowrunner workers started");
    pool.run(rt.config.max_jobs).await;
    tracing::info!("flowrunner workers stopped");
    Ok(())
}
