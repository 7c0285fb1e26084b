//! Run tracking types: run identity, step results and abort reasons.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run identity
// ---------------------------------------------------------------------------

/// Opaque run identifier: `<workflow>_<YYYYmmdd_HHMMSS>_<8 hex>`.
///
/// Unique across process restarts and safe to use as a file name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate(workflow_name: &str) -> Self {
        let slug: String = workflow_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        // The low bits of a v7 UUID are random; the high bits only encode time.
        let uuid = Uuid::now_v7().simple().to_string();
        let suffix = &uuid[uuid.len() - 8..];
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        Self(format!("{slug}_{stamp}_{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId(\"{}\")", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs and failures
// ---------------------------------------------------------------------------

/// Provider-agnostic tool result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
    /// Per sub-invocation results of a fan-out step, in input order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<SubResult>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One fan-out sub-invocation result. `index` matches the input position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResult {
    pub index: usize,
    pub tool: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolValidation,
    ToolExecution,
    UnknownTool,
    Timeout,
    TemplateResolution,
    StoreRead,
    StoreWrite,
    Cancelled,
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ToolValidation => "tool_validation",
            FailureKind::ToolExecution => "tool_execution",
            FailureKind::UnknownTool => "unknown_tool",
            FailureKind::Timeout => "timeout",
            FailureKind::TemplateResolution => "template_resolution",
            FailureKind::StoreRead => "store_read",
            FailureKind::StoreWrite => "store_write",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Outcome of one step within one run. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn success(step_name: &str, output: ToolOutput, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    pub fn failed(step_name: &str, failure: StepFailure, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Failed,
            output: None,
            error: Some(failure),
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    pub fn skipped(step_name: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn output_text(&self) -> Option<&str> {
        self.output.as_ref().map(|o| o.output.as_str())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Why a run ended in `aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    StepFailed {
        step: String,
        kind: FailureKind,
        message: String,
    },
    GateDenied {
        step: String,
    },
    GateExpired {
        step: String,
    },
    StoreWrite {
        step: String,
        message: String,
    },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },
}

impl AbortReason {
    pub fn step(&self) -> Option<&str> {
        match self {
            AbortReason::StepFailed { step, .. }
            | AbortReason::GateDenied { step }
            | AbortReason::GateExpired { step }
            | AbortReason::StoreWrite { step, .. } => Some(step),
            AbortReason::Cancelled { step } => step.as_deref(),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::StepFailed {
                step,
                kind,
                message,
            } => write!(f, "step '{step}' failed ({kind}): {message}"),
            AbortReason::GateDenied { step } => write!(f, "approval denied at step '{step}'"),
            AbortReason::GateExpired { step } => {
                write!(f, "approval timed out at step '{step}'")
            }
            AbortReason::StoreWrite { step, message } => {
                write!(f, "could not record step '{step}': {message}")
            }
            AbortReason::Cancelled { step: Some(step) } => {
                write!(f, "cancelled during step '{step}'")
            }
            AbortReason::Cancelled { step: None } => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow run
// ---------------------------------------------------------------------------

/// A single execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_name: String,
    /// Resolved parameter bindings (defaults applied).
    pub params: Map<String, Value>,
    pub status: RunStatus,
    /// Step results in declaration order.
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortReason>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(id: RunId, workflow_name: &str, params: Map<String, Value>) -> Self {
        Self {
            id,
            workflow_name: workflow_name.to_string(),
            params,
            status: RunStatus::Running,
            steps: Vec::new(),
            abort: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }

    /// Completed, but at least one `continue`-policy step failed.
    pub fn is_partial_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failed_steps().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_filesystem_safe() {
        let a = RunId::generate("my workflow/v2");
        let b = RunId::generate("my workflow/v2");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("my_workflow_v2_"));
        assert!(
            a.as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        );
    }

    #[test]
    fn abort_reason_serializes_with_tag() {
        let reason = AbortReason::StepFailed {
            step: "s2".into(),
            kind: FailureKind::ToolExecution,
            message: "boom".into(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "step_failed");
        assert_eq!(json["kind"], "tool_execution");
        assert_eq!(reason.step(), Some("s2"));
        assert_eq!(reason.to_string(), "step 's2' failed (tool_execution): boom");
    }

    #[test]
    fn partial_success_requires_completed_run_with_failure() {
        let mut run = WorkflowRun::new(RunId::from("r"), "wf", Map::new());
        run.steps.push(StepResult::success("a", ToolOutput::text("ok"), Utc::now()));
        run.status = RunStatus::Completed;
        assert!(!run.is_partial_success());

        run.steps.push(StepResult::failed(
            "b",
            StepFailure::new(FailureKind::ToolExecution, "x"),
            Utc::now(),
        ));
        assert!(run.is_partial_success());
        assert_eq!(run.step("a").and_then(StepResult::output_text), Some("ok"));
    }
}
