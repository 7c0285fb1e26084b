//! OpenAI-compatible chat completions client.
//!
//! One [`OpenAiCompatibleProvider`] serves OpenAI, Google Gemini, DeepSeek and
//! Mistral; they differ only in base URL and provider name.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use stepwise_core::llm::LlmProvider;
use stepwise_types::llm::{CompletionRequest, CompletionResponse, LlmError, ProviderKind, Usage};

use super::{retry_after, status_error};

/// Endpoint settings for one OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Human-readable provider name (e.g., "openai", "gemini").
    pub provider_name: String,
    /// Base URL for the API (e.g., "https://api.openai.com/v1").
    pub base_url: String,
}

impl OpenAiCompatConfig {
    pub fn for_kind(kind: ProviderKind) -> Self {
        let base_url = match kind {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Mistral => "https://api.mistral.ai/v1",
            // Anthropic has its own client; this is its compatibility layer.
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
        };
        Self {
            provider_name: kind.as_str().to_string(),
            base_url: base_url.to_string(),
        }
    }
}

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    api_key: SecretString,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(client: reqwest::Client, api_key: SecretString, config: OpenAiCompatConfig) -> Self {
        Self {
            client,
            api_key,
            config,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn to_chat_request(request: &CompletionRequest) -> ChatRequest<'_> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        ChatRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.config.provider_name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self
            .client
            .post(self.url())
            .bearer_auth(self.api_key.expose_secret())
            .json(&Self::to_chat_request(request))
            .send()
            .await
            .map_err(|e| LlmError::Provider {
                message: format!("HTTP request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry, body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse response: {e}")))?;
        body.into_completion()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl ChatResponse {
    fn into_completion(self) -> Result<CompletionResponse, LlmError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Deserialization("response has no choices".to_string()))?;
        let usage = self
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: self.model,
            stop_reason: choice.finish_reason,
            usage,
        })
    }
}
