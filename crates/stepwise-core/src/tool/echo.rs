//! `echo`: returns its input unchanged. Useful for wiring and dry runs.

use serde_json::{Map, Value};
use stepwise_types::run::ToolOutput;

use super::{Tool, ToolContext, ToolError};
use crate::template::value_to_string;

pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the `text` input (or the first input) as the step output"
    }

    fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError> {
        if inputs.is_empty() {
            return Err(ToolError::Validation("echo needs at least one input".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        inputs: Map<String, Value>,
        _ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let chosen = inputs
            .get("text")
            .or_else(|| inputs.values().next())
            .map(value_to_string)
            .unwrap_or_default();
        Ok(ToolOutput {
            output: chosen,
            outputs: Vec::new(),
            metadata: inputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolRegistry;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn echoes_text_or_first_input() {
        let reg = registry();
        let cancel = CancellationToken::new();

        let mut inputs = Map::new();
        inputs.insert("message".into(), json!("first"));
        inputs.insert("text".into(), json!("hello"));
        let out = reg.dispatch("echo", inputs, &cancel, None).await.unwrap();
        assert_eq!(out.output, "hello");
        assert_eq!(out.metadata["message"], json!("first"));

        let mut inputs = Map::new();
        inputs.insert("value".into(), json!(7));
        let out = reg.dispatch("echo", inputs, &cancel, None).await.unwrap();
        assert_eq!(out.output, "7");
    }

    #[tokio::test]
    async fn rejects_empty_inputs() {
        let err = registry()
            .dispatch("echo", Map::new(), &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, stepwise_types::run::FailureKind::ToolValidation);
    }
}
