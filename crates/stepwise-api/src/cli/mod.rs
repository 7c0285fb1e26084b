//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros. Commands are grouped noun-first
//! (`stepwise workflow run`, `stepwise secret set`).

pub mod approver;
pub mod memory;
pub mod secret;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run multi-step tool workflows with memory and approval gates.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STEPWISE_OTEL")]
    pub otel: bool,

    /// Workflow definition file (defaults to ./workflows.yaml, then the data directory).
    #[arg(long, global = true, env = "STEPWISE_WORKFLOWS")]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List, validate, run and inspect workflows.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Inspect and prune the run memory store.
    Memory {
        #[command(subcommand)]
        action: memory::MemoryCommand,
    },

    /// Manage provider API keys in the encrypted vault.
    Secret {
        #[command(subcommand)]
        action: secret::SecretCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_params() {
        let cli = Cli::try_parse_from([
            "stepwise", "--json", "workflow", "run", "research", "-p", "topic=rust", "-p",
            "depth=3", "--yes",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Workflow {
                action: workflow::WorkflowCommand::Run { name, params, yes },
            } => {
                assert_eq!(name, "research");
                assert_eq!(params, vec!["topic=rust", "depth=3"]);
                assert!(yes);
            }
            _ => panic!("expected workflow run"),
        }
    }

    #[test]
    fn inspect_needs_a_run_id_or_recent() {
        assert!(Cli::try_parse_from(["stepwise", "workflow", "inspect"]).is_err());
        assert!(Cli::try_parse_from(["stepwise", "workflow", "inspect", "--recent"]).is_ok());
        assert!(Cli::try_parse_from(["stepwise", "workflow", "inspect", "r1"]).is_ok());
    }
}
