//! Per-run state the executor threads from one step to the next.

use serde_json::{Map, Value, json};
use stepwise_types::run::{StepResult, StepStatus};

use crate::template::Scope;

/// Parameters plus the `steps.*` layer built up as steps are recorded.
#[derive(Debug, Clone)]
pub struct RunContext {
    params: Map<String, Value>,
    steps: Map<String, Value>,
    max_output_bytes: usize,
}

impl RunContext {
    pub fn new(params: Map<String, Value>, max_output_bytes: usize) -> Self {
        Self {
            params,
            steps: Map::new(),
            max_output_bytes,
        }
    }

    /// Expose a recorded step to later steps as `steps.<name>`.
    ///
    /// Only successful steps carry `output`, so a reference to a failed or
    /// skipped step's output resolves as a missing path.
    pub fn record(&mut self, result: &StepResult) {
        let entry = match (&result.status, &result.output) {
            (StepStatus::Success, Some(output)) => json!({
                "status": result.status,
                "output": truncate_output(&output.output, self.max_output_bytes),
                "outputs": output.outputs,
                "metadata": output.metadata,
            }),
            _ => json!({
                "status": result.status,
                "error": result.error,
            }),
        };
        self.steps.insert(result.step_name.clone(), entry);
    }

    /// Fresh scope for one step.
    pub fn scope(&self, memory: Map<String, Value>) -> Scope {
        Scope::new()
            .with_params(self.params.clone())
            .with_steps(self.steps.clone())
            .with_memory(memory)
    }
}

/// Cut `text` to at most `max_bytes` on a char boundary, appending a marker.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepwise_types::run::{FailureKind, StepFailure, ToolOutput};

    #[test]
    fn failed_steps_have_no_output() {
        let mut ctx = RunContext::new(Map::new(), 1024);
        ctx.record(&StepResult::success("a", ToolOutput::text("hi"), Utc::now()));
        ctx.record(&StepResult::failed(
            "b",
            StepFailure::new(FailureKind::ToolExecution, "boom"),
            Utc::now(),
        ));
        let scope = ctx.scope(Map::new());
        assert_eq!(scope.lookup("steps.a.output"), Some(&json!("hi")));
        assert_eq!(scope.lookup("steps.b.status"), Some(&json!("failed")));
        assert!(scope.lookup("steps.b.output").is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("short", 10), "short");
        let cut = truncate_output("héllo", 2);
        assert!(cut.starts_with("h\n[truncated"));
    }
}
