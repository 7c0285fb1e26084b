//! `parallel_query`: run independent sub-invocations concurrently.
//!
//! Each entry of `queries` names a tool (default `model_call`) plus that
//! tool's inputs. Sub-invocations run on a `JoinSet` bounded by a semaphore;
//! results are written back by input index so the output order never depends
//! on completion order.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use stepwise_types::run::{StepStatus, SubResult, ToolOutput};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{Tool, ToolContext, ToolError};

pub const FAN_OUT_TOOL: &str = "parallel_query";

const DEFAULT_SUB_TOOL: &str = "model_call";

pub struct FanOutTool;

struct SubInvocation {
    index: usize,
    tool: String,
    inputs: Map<String, Value>,
}

/// Split a query entry into its tool name and that tool's inputs.
/// `prompt_template` is accepted as a spelling of `prompt`.
fn sub_invocation(index: usize, query: Map<String, Value>) -> SubInvocation {
    let mut inputs = query;
    let tool = match inputs.remove("tool") {
        Some(Value::String(tool)) => tool,
        _ => DEFAULT_SUB_TOOL.to_string(),
    };
    if !inputs.contains_key("prompt") {
        if let Some(template) = inputs.remove("prompt_template") {
            inputs.insert("prompt".into(), template);
        }
    }
    SubInvocation {
        index,
        tool,
        inputs,
    }
}

impl Tool for FanOutTool {
    fn name(&self) -> &str {
        FAN_OUT_TOOL
    }

    fn description(&self) -> &str {
        "Run a list of independent tool calls concurrently and collect ordered results"
    }

    fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError> {
        let queries = match inputs.get("queries") {
            Some(Value::Array(queries)) if !queries.is_empty() => queries,
            Some(Value::Array(_)) => {
                return Err(ToolError::Validation("'queries' must not be empty".into()));
            }
            Some(_) => return Err(ToolError::Validation("'queries' must be a list".into())),
            None => return Err(ToolError::Validation("missing required input 'queries'".into())),
        };

        for (index, query) in queries.iter().enumerate() {
            let Value::Object(query) = query else {
                return Err(ToolError::Validation(format!("query {index} must be a map")));
            };
            match query.get("tool") {
                None => {}
                Some(Value::String(tool)) if tool == FAN_OUT_TOOL => {
                    return Err(ToolError::Validation(format!(
                        "query {index} cannot nest '{FAN_OUT_TOOL}'"
                    )));
                }
                Some(Value::String(_)) => {}
                Some(_) => {
                    return Err(ToolError::Validation(format!(
                        "query {index}: 'tool' must be a string"
                    )));
                }
            }
        }

        if let Some(workers) = inputs.get("max_workers") {
            if workers.as_u64().is_none_or(|n| n == 0) {
                return Err(ToolError::Validation(
                    "'max_workers' must be a positive integer".into(),
                ));
            }
        }
        if inputs.get("fail_fast").is_some_and(|v| !v.is_boolean()) {
            return Err(ToolError::Validation("'fail_fast' must be a boolean".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut inputs: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let queries = match inputs.remove("queries") {
            Some(Value::Array(queries)) => queries,
            _ => return Err(ToolError::Validation("missing required input 'queries'".into())),
        };
        let ceiling = ctx.registry.max_fan_out();
        let workers = inputs
            .get("max_workers")
            .and_then(Value::as_u64)
            .map_or(ceiling, |n| usize::try_from(n).unwrap_or(usize::MAX))
            .clamp(1, ceiling.max(1));
        let fail_fast = inputs
            .get("fail_fast")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let total = queries.len();
        tracing::debug!(queries = total, workers, fail_fast, "fan-out starting");

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set = JoinSet::new();
        for (index, query) in queries.into_iter().enumerate() {
            let query = match query {
                Value::Object(map) => map,
                other => {
                    return Err(ToolError::Validation(format!(
                        "query {index} must be a map, got {other}"
                    )));
                }
            };
            let sub = sub_invocation(index, query);
            let registry = Arc::clone(&ctx.registry);
            let cancel = ctx.cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => registry.dispatch(&sub.tool, sub.inputs, &cancel, None).await,
                    Err(_) => Err(ToolError::Cancelled.into_failure()),
                };
                (sub.index, sub.tool, result)
            });
        }

        let mut slots: Vec<Option<SubResult>> = vec![None; total];
        while let Some(joined) = join_set.join_next().await {
            let (index, tool, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    tracing::warn!("fan-out task ended abnormally: {err}");
                    continue;
                }
            };
            let sub = match result {
                Ok(output) => SubResult {
                    index,
                    tool,
                    status: StepStatus::Success,
                    output: output.output,
                    metadata: output.metadata,
                    error: None,
                },
                Err(failure) => {
                    tracing::debug!(index, tool = %tool, error = %failure, "sub-invocation failed");
                    if fail_fast {
                        ctx.cancel.cancel();
                        join_set.abort_all();
                        return Err(ToolError::Execution(format!(
                            "query {index} ({tool}) failed: {failure}"
                        )));
                    }
                    SubResult {
                        index,
                        tool,
                        status: StepStatus::Failed,
                        output: String::new(),
                        metadata: Map::new(),
                        error: Some(failure),
                    }
                }
            };
            slots[index] = Some(sub);
        }

        let outputs: Vec<SubResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| SubResult {
                    index,
                    tool: String::new(),
                    status: StepStatus::Failed,
                    output: String::new(),
                    metadata: Map::new(),
                    error: Some(ToolError::Execution("sub-invocation did not complete".into()).into_failure()),
                })
            })
            .collect();

        let successes: Vec<&str> = outputs
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .map(|s| s.output.as_str())
            .collect();
        let successful = successes.len();
        let output = successes.join("\n\n");

        let mut metadata = Map::new();
        metadata.insert("query_count".into(), json!(total));
        metadata.insert("successful_queries".into(), json!(successful));
        metadata.insert("max_workers".into(), json!(workers));

        Ok(ToolOutput {
            output,
            outputs,
            metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
