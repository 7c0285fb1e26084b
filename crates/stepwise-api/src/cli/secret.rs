//! Secret management CLI commands: set, list, delete.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Password;
use stepwise_core::secret::SecretService;
use stepwise_types::secret::SecretSource;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum SecretCommand {
    /// Store a secret in the encrypted vault.
    Set {
        /// Secret key name (e.g., ANTHROPIC_API_KEY).
        key: String,

        /// Secret value (optional; prompts with hidden input if omitted).
        value: Option<String>,
    },

    /// List known secrets with masked values.
    #[command(alias = "ls")]
    List,

    /// Delete a secret from the vault.
    #[command(alias = "rm")]
    Delete {
        /// Secret key name.
        key: String,
    },
}

pub async fn handle(state: &AppState, action: SecretCommand, json: bool) -> Result<()> {
    match action {
        SecretCommand::Set { key, value } => set_secret(state, &key, value, json).await,
        SecretCommand::List => list_secrets(state, json).await,
        SecretCommand::Delete { key } => delete_secret(state, &key, json).await,
    }
}

/// Set a secret value, prompting with hidden input when no value is given.
///
/// ```bash
/// stepwise secret set ANTHROPIC_API_KEY
/// stepwise secret set ANTHROPIC_API_KEY sk-...
/// ```
async fn set_secret(state: &AppState, key: &str, value: Option<String>, json: bool) -> Result<()> {
    let secret_value = match value {
        Some(v) => v,
        None => Password::new()
            .with_prompt(format!("Enter value for {}", style(key).bold()))
            .interact()?,
    };

    state.secret_service.set_secret(key, &secret_value).await?;

    let masked = SecretService::mask_secret(&secret_value);
    if json {
        println!("{}", serde_json::json!({"set": true, "key": key, "masked": masked}));
    } else {
        println!(
            "  {} Secret '{}' set ({masked})",
            style("✓").green().bold(),
            style(key).bold(),
        );
    }
    Ok(())
}

async fn list_secrets(state: &AppState, json: bool) -> Result<()> {
    let entries = state.secret_service.list_secrets().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!(
            "  {} No secrets stored. Add one with: {}",
            style("i").blue().bold(),
            style("stepwise secret set ANTHROPIC_API_KEY").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Key").fg(Color::White),
        Cell::new("Value").fg(Color::White),
        Cell::new("Source").fg(Color::White),
    ]);

    for entry in &entries {
        let masked = match state.secret_service.get_secret(&entry.key).await {
            Some(val) => SecretService::mask_secret(&val),
            None => "****".to_string(),
        };
        let source = match entry.source {
            SecretSource::Vault => Cell::new(entry.source).fg(Color::Green),
            SecretSource::Environment => Cell::new(entry.source).fg(Color::Yellow),
        };
        table.add_row(vec![Cell::new(&entry.key).fg(Color::Cyan), Cell::new(masked), source]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} secret{}",
        style(entries.len()).bold(),
        if entries.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

async fn delete_secret(state: &AppState, key: &str, json: bool) -> Result<()> {
    state.secret_service.delete_secret(key).await?;

    if json {
        println!("{}", serde_json::json!({"deleted": true, "key": key}));
    } else {
        println!("  {} Secret '{}' deleted", style("✓").green().bold(), style(key).bold());
    }
    Ok(())
}
