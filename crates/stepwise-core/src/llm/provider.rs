//! LlmProvider trait definition.

use stepwise_types::llm::{CompletionRequest, CompletionResponse, LlmError, ProviderKind};

use super::box_provider::BoxLlmProvider;

/// Trait for LLM provider backends (Anthropic, OpenAI-compatible, ...).
///
/// Implementations live in stepwise-infra.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "anthropic", "deepseek").
    fn name(&self) -> &str;

    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}

/// Builds a provider once the API key for its backend is known.
///
/// Keys are looked up per call, so providers are built per call too.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, kind: ProviderKind, api_key: String) -> Result<BoxLlmProvider, LlmError>;
}
