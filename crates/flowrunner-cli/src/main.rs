//! flowrunner — run agent flows as isolated, streamed tasks.

mod api;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use commands::{execute, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("flowrunner: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
