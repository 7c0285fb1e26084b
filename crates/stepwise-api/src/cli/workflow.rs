//! Workflow subcommands: list, validate, run, inspect.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use stepwise_core::engine::RunInspection;
use stepwise_core::workflow::{Approver, AutoApprove};
use stepwise_types::run::{RunId, RunStatus, StepResult, StepStatus, WorkflowRun};

use super::approver::TerminalApprover;
use crate::state::{AppState, Engine};

/// Characters of output or content shown per table cell.
const PREVIEW_CHARS: usize = 60;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List loaded workflows.
    #[command(alias = "ls")]
    List,

    /// Load and validate every workflow definition.
    Validate,

    /// Run a workflow.
    Run {
        /// Workflow name.
        name: String,

        /// Parameter as key=value (repeatable). JSON values are parsed,
        /// anything else is taken as a string.
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Approve every gate without prompting.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show recorded step results and memory of a run.
    Inspect {
        /// Run id to inspect.
        #[arg(required_unless_present = "recent")]
        run_id: Option<String>,

        /// List recent runs instead.
        #[arg(long, conflicts_with = "run_id")]
        recent: bool,

        /// Number of recent runs to list.
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

pub async fn handle(state: &AppState, action: WorkflowCommand, json: bool, quiet: bool) -> Result<ExitCode> {
    match action {
        WorkflowCommand::List => list(state, json)?,
        WorkflowCommand::Validate => validate(state, json)?,
        WorkflowCommand::Run { name, params, yes } => {
            return run(state, &name, &params, yes, json, quiet).await;
        }
        WorkflowCommand::Inspect {
            run_id: Some(run_id),
            ..
        } => inspect(state, &RunId::from(run_id), json).await?,
        WorkflowCommand::Inspect { limit, .. } => recent(state, limit, json).await?,
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// list / validate
// ---------------------------------------------------------------------------

fn list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.engine()?.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!(
            "  {} No workflows found. Create {} or pass {}.",
            style("i").blue().bold(),
            style("workflows.yaml").yellow(),
            style("--file").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Description"),
            Cell::new("Params"),
            Cell::new("Steps"),
        ]);

    for w in &workflows {
        let params = w
            .params
            .iter()
            .map(|p| match &p.default {
                Some(default) => format!("{}={}", p.name, display_value(default)),
                None if p.is_required() => format!("{}*", p.name),
                None => p.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");

        table.add_row(vec![
            Cell::new(&w.name),
            Cell::new(w.description.as_deref().unwrap_or("-")),
            Cell::new(params),
            Cell::new(format!("{}: {}", w.step_count, w.step_names.join(" > "))),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!("  {} required parameter", style("*").bold());
    println!();
    Ok(())
}

fn validate(state: &AppState, json: bool) -> Result<()> {
    let engine = state.engine()?;
    let names: Vec<String> = engine.list().into_iter().map(|w| w.name).collect();

    if json {
        println!("{}", serde_json::json!({ "valid": true, "workflows": names }));
    } else {
        let source = state
            .workflow_file()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "default locations".to_string());
        println!(
            "  {} {} workflow{} valid ({})",
            style("✓").green().bold(),
            names.len(),
            if names.len() == 1 { "" } else { "s" },
            style(source).dim()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run(
    state: &AppState,
    name: &str,
    raw_params: &[String],
    yes: bool,
    json: bool,
    quiet: bool,
) -> Result<ExitCode> {
    let engine = Arc::new(state.engine()?);
    let definition = engine
        .definition(name)
        .with_context(|| format!("unknown workflow '{name}'"))?;
    let gated = definition.steps.iter().any(|s| s.gate.is_some());
    let params = parse_params(raw_params)?;

    // A spinner would fight with gate prompts for the terminal.
    let spinner = (!json && !quiet && (yes || !gated)).then(|| running_spinner(name));

    let run = if yes {
        run_cancellable(&engine, name, params, &AutoApprove).await?
    } else {
        run_cancellable(&engine, name, params, &TerminalApprover).await?
    };

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else if !quiet {
        print_run(&run);
    }

    Ok(match run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Run under a fresh id; Ctrl-C cancels the run cooperatively.
async fn run_cancellable<A: Approver>(
    engine: &Arc<Engine>,
    name: &str,
    params: Map<String, Value>,
    approver: &A,
) -> Result<WorkflowRun> {
    let run_id = RunId::generate(name);

    let watcher = {
        let engine = Arc::clone(engine);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n  {} cancelling run...", style("!").yellow().bold());
                engine.cancel(&run_id);
            }
        })
    };

    let result = engine.run_with_id(name, run_id, params, approver).await;
    watcher.abort();
    Ok(result?)
}

fn running_spinner(name: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("  {spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Running {}", style(name).bold()));
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type.
pub fn parse_params(raw: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid parameter '{pair}': expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid parameter '{pair}': empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

fn print_run(run: &WorkflowRun) {
    println!();
    for step in &run.steps {
        println!("  {} {}", status_mark(step.status), step_line(step));
    }
    println!();

    match (&run.status, &run.abort) {
        (RunStatus::Completed, _) if run.is_partial_success() => println!(
            "  {} {} completed with failed steps",
            style("~").yellow().bold(),
            style(&run.workflow_name).bold()
        ),
        (RunStatus::Completed, _) => println!(
            "  {} {} completed",
            style("✓").green().bold(),
            style(&run.workflow_name).bold()
        ),
        (_, Some(reason)) => println!(
            "  {} {} aborted: {reason}",
            style("✗").red().bold(),
            style(&run.workflow_name).bold()
        ),
        (status, None) => println!("  {} {status}", style(&run.workflow_name).bold()),
    }
    println!("  {}", style(format!("run id: {}", run.id)).dim());
    println!();
}

fn step_line(step: &StepResult) -> String {
    let duration = step
        .duration_ms()
        .map(|ms| format!(" {}", style(format!("({ms} ms)")).dim()))
        .unwrap_or_default();
    match (&step.output, &step.error) {
        (_, Some(error)) => format!("{}{duration}  {}", step.step_name, style(error).red()),
        (Some(output), None) => format!(
            "{}{duration}  {}",
            step.step_name,
            preview(&output.output)
        ),
        (None, None) => step.step_name.clone(),
    }
}

fn status_mark(status: StepStatus) -> String {
    match status {
        StepStatus::Success => style("✓").green().bold().to_string(),
        StepStatus::Failed => style("✗").red().bold().to_string(),
        StepStatus::Skipped => style("-").dim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

async fn inspect(state: &AppState, run_id: &RunId, json: bool) -> Result<()> {
    let inspection = state.memory_engine()?.inspect(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
        return Ok(());
    }
    print_inspection(&inspection);
    Ok(())
}

fn print_inspection(inspection: &RunInspection) {
    let mut steps = Table::new();
    steps
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Output / Error"),
        ]);

    for s in &inspection.steps {
        let status = match s.status {
            StepStatus::Success => Cell::new(s.status).fg(Color::Green),
            StepStatus::Failed => Cell::new(s.status).fg(Color::Red),
            StepStatus::Skipped => Cell::new(s.status).fg(Color::DarkGrey),
        };
        let detail = match (&s.error, s.output_text()) {
            (Some(error), _) => error.to_string(),
            (None, Some(text)) => preview(text),
            (None, None) => String::new(),
        };
        steps.add_row(vec![
            Cell::new(&s.step_name),
            status,
            Cell::new(s.duration_ms().map(|ms| format!("{ms} ms")).unwrap_or_default()),
            Cell::new(detail),
        ]);
    }

    let mut slices = Table::new();
    slices
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Class"),
            Cell::new("Created"),
            Cell::new("Content"),
        ]);

    for slice in &inspection.slices {
        slices.add_row(vec![
            Cell::new(slice.id),
            Cell::new(&slice.step_name),
            Cell::new(slice.classification.as_str()),
            Cell::new(slice.created_at.format("%Y-%m-%d %H:%M:%S").to_string())
                .fg(Color::DarkGrey),
            Cell::new(preview(&slice.content)),
        ]);
    }

    println!();
    println!("  Run {}", style(&inspection.run_id).bold());
    println!();
    println!("{steps}");
    println!();
    println!("{slices}");
    println!();
}

async fn recent(state: &AppState, limit: usize, json: bool) -> Result<()> {
    let runs = state.memory_engine()?.recent_runs(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  {} No recorded runs.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Slices"),
            Cell::new("Started"),
            Cell::new("Last activity"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(&r.run_id),
            Cell::new(r.slice_count),
            Cell::new(r.first_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(r.last_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(PREVIEW_CHARS).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => preview(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_keep_json_types() {
        let params = parse_params(&[
            "topic=rust async".to_string(),
            "depth=3".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "expr=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(params["topic"], json!("rust async"));
        assert_eq!(params["depth"], json!(3));
        assert_eq!(params["tags"], json!(["a", "b"]));
        assert_eq!(params["expr"], json!("a=b"));
    }

    #[test]
    fn params_require_key_value() {
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=x".to_string()]).is_err());
    }

    #[test]
    fn preview_cuts_long_and_multiline_text() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview("line one\nline two"), "line one…");
        assert_eq!(preview(&"x".repeat(100)).chars().count(), PREVIEW_CHARS + 1);
    }
}
