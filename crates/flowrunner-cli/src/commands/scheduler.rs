//! `flowrunner scheduler` — the periodic reconciler.

use clap::Args;

use flowrunner_core::telemetry::ServiceRole;
use flowrunner_core::Reaper;

use super::{bootstrap, shutdown_signal, ConfigArgs, StartupError};

#[derive(Args)]
pub struct SchedulerArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn execute(args: SchedulerArgs) -> Result<(), StartupError> {
    let config = args.config.into_config()?;
    let rt = bootstrap(config, ServiceRole::Scheduler).await?;

    let reaper = Reaper::new(
        std::sync::Arc::clone(&rt.bus),
        std::sync::Arc::clone(&rt.store),
        std::sync::Arc::clone(&rt.config),
    );
    tracing::info!("flowrunner reconciler started");
    reaper.run(shutdown_signal()).await;
    Ok(())
}
