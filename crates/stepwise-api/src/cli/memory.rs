//! Memory store CLI commands: stats, purge.

use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum MemoryCommand {
    /// Slice counts per classification and number of recorded runs.
    Stats,

    /// Delete memory slices older than a cutoff.
    Purge {
        /// Age cutoff in days (defaults to `memory_retention_days` from config.toml).
        #[arg(long)]
        older_than_days: Option<u32>,

        /// Skip confirmation prompt.
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle(state: &AppState, action: MemoryCommand, json: bool) -> Result<()> {
    match action {
        MemoryCommand::Stats => stats(state, json).await,
        MemoryCommand::Purge {
            older_than_days,
            force,
        } => purge(state, older_than_days, force, json).await,
    }
}

async fn stats(state: &AppState, json: bool) -> Result<()> {
    let stats = state.memory_engine()?.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Classification").fg(Color::White),
        Cell::new("Slices").fg(Color::White),
    ]);
    for (classification, count) in &stats.by_classification {
        table.add_row(vec![Cell::new(classification).fg(Color::Cyan), Cell::new(count)]);
    }

    println!();
    println!(
        "  {} slices across {} runs",
        style(stats.total_slices).bold(),
        style(stats.distinct_runs).bold()
    );
    if !stats.by_classification.is_empty() {
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}

async fn purge(state: &AppState, older_than_days: Option<u32>, force: bool, json: bool) -> Result<()> {
    let days = older_than_days.unwrap_or(state.config.memory_retention_days);

    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete memory slices older than {days} days?"))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let cutoff = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    let removed = state.memory_engine()?.purge_memory(cutoff).await?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed, "older_than_days": days }));
    } else {
        println!(
            "  {} Removed {} slice{} older than {days} days",
            style("✓").green().bold(),
            removed,
            if removed == 1 { "" } else { "s" }
        );
    }
    Ok(())
}
