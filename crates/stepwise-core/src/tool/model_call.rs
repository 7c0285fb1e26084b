//! `model_call`: one completion request against an LLM provider.
//!
//! The API key is looked up through the secret chain on every call. With no
//! key configured the tool returns a clearly marked simulated response so
//! workflows stay runnable offline.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};
use stepwise_types::llm::{CompletionRequest, ProviderKind};
use stepwise_types::run::ToolOutput;
use tracing::Instrument;

use super::{Tool, ToolContext, ToolError, required_str};
use crate::llm::ProviderFactory;
use crate::secret::SecretService;
use crate::template::value_to_string;

pub const MODEL_CALL_TOOL: &str = "model_call";

const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const SIMULATED_PROMPT_CHARS: usize = 50;

pub struct ModelCallTool {
    secrets: Arc<SecretService>,
    providers: Arc<dyn ProviderFactory>,
}

impl ModelCallTool {
    pub fn new(secrets: Arc<SecretService>, providers: Arc<dyn ProviderFactory>) -> Self {
        Self { secrets, providers }
    }
}

fn request_from_inputs(inputs: &Map<String, Value>) -> Result<(ProviderKind, CompletionRequest), ToolError> {
    let provider: ProviderKind = required_str(inputs, "provider")?
        .parse()
        .map_err(|e: stepwise_types::llm::LlmError| ToolError::Validation(e.to_string()))?;
    let model = required_str(inputs, "model")?.to_string();
    let prompt = match inputs.get("prompt") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Null) | Some(Value::String(_)) | None => {
            return Err(ToolError::Validation("missing required input 'prompt'".into()));
        }
        Some(other) => value_to_string(other),
    };
    let system = inputs
        .get("system")
        .filter(|v| !v.is_null())
        .map(value_to_string)
        .filter(|s| !s.is_empty());
    let max_tokens = match inputs.get("max_tokens") {
        None | Some(Value::Null) => DEFAULT_MAX_TOKENS,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| ToolError::Validation("'max_tokens' must be a positive integer".into()))?,
    };
    let temperature = match inputs.get("temperature") {
        None | Some(Value::Null) => DEFAULT_TEMPERATURE,
        Some(v) => v
            .as_f64()
            .filter(|t| (0.0..=2.0).contains(t))
            .map(|t| t as f32)
            .ok_or_else(|| ToolError::Validation("'temperature' must be between 0 and 2".into()))?,
    };

    Ok((
        provider,
        CompletionRequest {
            model,
            prompt,
            system,
            max_tokens,
            temperature,
        },
    ))
}

fn simulated(provider: ProviderKind, request: &CompletionRequest) -> ToolOutput {
    let preview: String = request.prompt.chars().take(SIMULATED_PROMPT_CHARS).collect();
    ToolOutput::text(format!(
        "[SIMULATED {provider}/{}] Response to: {preview}...",
        request.model
    ))
    .with_meta("provider", provider.as_str())
    .with_meta("model", request.model.clone())
    .with_meta("simulated", true)
}

impl Tool for ModelCallTool {
    fn name(&self) -> &str {
        MODEL_CALL_TOOL
    }

    fn description(&self) -> &str {
        "Send a prompt to an LLM provider and return the completion"
    }

    fn validate(&self, inputs: &Map<String, Value>) -> Result<(), ToolError> {
        request_from_inputs(inputs).map(|_| ())
    }

    async fn execute(
        &self,
        inputs: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let (provider, request) = request_from_inputs(&inputs)?;

        let Some(api_key) = self.secrets.get_secret(provider.api_key_name()).await else {
            tracing::info!(
                provider = %provider,
                model = %request.model,
                "no {} configured, returning simulated response",
                provider.api_key_name()
            );
            return Ok(simulated(provider, &request));
        };

        let client = self
            .providers
            .build(provider, api_key)
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let span = tracing::info_span!(
            "chat",
            gen_ai.operation.name = "chat",
            gen_ai.provider.name = %provider,
            gen_ai.request.model = %request.model,
            gen_ai.request.max_tokens = request.max_tokens,
            gen_ai.usage.input_tokens = tracing::field::Empty,
            gen_ai.usage.output_tokens = tracing::field::Empty,
        );

        let started = Instant::now();
        let response = tokio::select! {
            response = client.complete(&request).instrument(span.clone()) => response,
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };
        let response =
            response.map_err(|e| ToolError::Execution(format!("{provider} call failed: {e}")))?;

        span.record("gen_ai.usage.input_tokens", response.usage.input_tokens);
        span.record("gen_ai.usage.output_tokens", response.usage.output_tokens);

        Ok(ToolOutput::text(response.content)
            .with_meta("provider", provider.as_str())
            .with_meta("model", response.model)
            .with_meta("simulated", false)
            .with_meta("input_tokens", response.usage.input_tokens)
            .with_meta("output_tokens", response.usage.output_tokens)
            .with_meta("stop_reason", json!(response.stop_reason))
            .with_meta("execution_time_ms", started.elapsed().as_millis() as u64))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BoxLlmProvider, LlmProvider};
    use crate::secret::{SecretProvider, dyn_provider};
    use crate::tool::ToolRegistry;
    use stepwise_types::error::SecretError;
    use stepwise_types::llm::{CompletionResponse, LlmError, Usage};
    use stepwise_types::secret::SecretEntry;
    use tokio_util::sync::CancellationToken;

    struct FixedSecret(&'static str, &'static str);

    impl SecretProvider for FixedSecret {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
            Ok((key == self.0).then(|| self.1.to_string()))
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), SecretError> {
            Err(SecretError::ReadOnly)
        }
        async fn delete(&self, _key: &str) -> Result<(), SecretError> {
            Err(SecretError::ReadOnly)
        }
        async fn list(&self) -> Result<Vec<SecretEntry>, SecretError> {
            Ok(Vec::new())
        }
    }

    struct Shout {
        fail: bool,
    }

    impl LlmProvider for Shout {
        fn name(&self) -> &str {
            "shout"
        }
        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            if self.fail {
                return Err(LlmError::AuthenticationFailed);
            }
            Ok(CompletionResponse {
                content: request.prompt.to_uppercase(),
                model: request.model.clone(),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens: 3,
                    output_tokens: 5,
                },
            })
        }
    }

    struct ShoutFactory {
        fail: bool,
    }

    impl ProviderFactory for ShoutFactory {
        fn build(&self, _kind: ProviderKind, api_key: String) -> Result<BoxLlmProvider, LlmError> {
            assert_eq!(api_key, "sk-test");
            Ok(BoxLlmProvider::new(Shout { fail: self.fail }))
        }
    }

    fn registry(secrets: SecretService, fail: bool) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(ModelCallTool::new(
            Arc::new(secrets),
            Arc::new(ShoutFactory { fail }),
        ));
        Arc::new(registry)
    }

    fn inputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn missing_key_returns_simulated_output() {
        let prompt = "x".repeat(80);
        let out = registry(SecretService::empty(), false)
            .dispatch(
                MODEL_CALL_TOOL,
                inputs(json!({"provider": "deepseek", "model": "deepseek-chat", "prompt": prompt})),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            out.output,
            format!("[SIMULATED deepseek/deepseek-chat] Response to: {}...", "x".repeat(50))
        );
        assert_eq!(out.metadata["simulated"], json!(true));
    }

    #[tokio::test]
    async fn configured_key_calls_the_provider() {
        let secrets = SecretService::new(vec![dyn_provider(FixedSecret("ANTHROPIC_API_KEY", "sk-test"))]);
        let out = registry(secrets, false)
            .dispatch(
                MODEL_CALL_TOOL,
                inputs(json!({"provider": "anthropic", "model": "claude", "prompt": "hi"})),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.output, "HI");
        assert_eq!(out.metadata["simulated"], json!(false));
        assert_eq!(out.metadata["output_tokens"], json!(5));
    }

    #[tokio::test]
    async fn provider_errors_are_execution_failures() {
        let secrets = SecretService::new(vec![dyn_provider(FixedSecret("MISTRAL_API_KEY", "sk-test"))]);
        let err = registry(secrets, true)
            .dispatch(
                MODEL_CALL_TOOL,
                inputs(json!({"provider": "mistral", "model": "m", "prompt": "hi"})),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, stepwise_types::run::FailureKind::ToolExecution);
    }

    #[test]
    fn validation() {
        let tool = ModelCallTool::new(Arc::new(SecretService::empty()), Arc::new(ShoutFactory { fail: false }));
        let ok = inputs(json!({"provider": "openai", "model": "gpt", "prompt": "p"}));
        assert!(tool.validate(&ok).is_ok());

        for bad in [
            json!({"model": "gpt", "prompt": "p"}),
            json!({"provider": "cohere", "model": "c", "prompt": "p"}),
            json!({"provider": "openai", "model": "gpt", "prompt": ""}),
            json!({"provider": "openai", "model": "gpt", "prompt": "p", "max_tokens": 0}),
            json!({"provider": "openai", "model": "gpt", "prompt": "p", "temperature": 9.0}),
        ] {
            assert!(matches!(tool.validate(&inputs(bad)), Err(ToolError::Validation(_))));
        }

        let (_, request) = request_from_inputs(&ok).unwrap();
        assert_eq!(request.max_tokens, 1024);
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
    }
}
