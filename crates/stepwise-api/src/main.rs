//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, installs tracing, wires the application state and
//! dispatches to the command handlers.

mod cli;
mod state;

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use stepwise_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    init_tracing(verbosity_filter(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let state = AppState::init(cli.file).await?;

    match cli.command {
        Commands::Workflow { action } => {
            return cli::workflow::handle(&state, action, cli.json, cli.quiet).await;
        }
        Commands::Memory { action } => cli::memory::handle(&state, action, cli.json).await?,
        Commands::Secret { action } => cli::secret::handle(&state, action, cli.json).await?,
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(ExitCode::SUCCESS)
}
