//! AnthropicProvider: [`LlmProvider`] for the Anthropic Messages API
//! (`/v1/messages`).
//!
//! The API key is wrapped in [`secrecy::SecretString`] and is only exposed
//! when building request headers.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use stepwise_core::llm::LlmProvider;
use stepwise_types::llm::{CompletionRequest, CompletionResponse, LlmError, Usage};

use super::{retry_after, status_error};

// Does not derive Debug so the key never reaches a log line.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl AnthropicProvider {
    /// The Anthropic API version header value.
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(client: reqwest::Client, api_key: SecretString) -> Self {
        Self {
            client,
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing or proxies).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn to_anthropic_request<'a>(request: &'a CompletionRequest) -> AnthropicRequest<'a> {
        AnthropicRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            temperature: request.temperature,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &request.prompt,
            }],
        }
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self
            .client
            .post(self.url())
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", Self::API_VERSION)
            .json(&Self::to_anthropic_request(request))
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

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Deserialization(format!("failed to parse response: {e}")))?;
        Ok(body.into_completion())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    temperature: f32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicResponse {
    fn into_completion(self) -> CompletionResponse {
        let content = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
                AnthropicContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        CompletionResponse {
            content,
            model: self.model,
            stop_reason: self.stop_reason,
            usage: Usage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "claude-sonnet-4-5".to_string(),
            prompt: "Hello".to_string(),
            system: Some("Be brief".to_string()),
            max_tokens: 256,
            temperature: 0.2,
        }
    }

    #[test]
    fn request_body_shape() {
        let request = request();
        let body = serde_json::to_value(AnthropicProvider::to_anthropic_request(&request)).unwrap();
        assert_eq!(body["model"], "claude-sonnet-4-5");
        assert_eq!(body["system"], "Be brief");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello");
    }

    #[test]
    fn response_text_blocks_are_joined() {
        let raw = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "text", "text": "Hel"},
                {"type": "tool_use", "id": "t", "name": "x", "input": {}},
                {"type": "text", "text": "lo"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        });
        let parsed: AnthropicResponse = serde_json::from_value(raw).unwrap();
        let completion = parsed.into_completion();
        assert_eq!(completion.content, "Hello");
        assert_eq!(completion.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(completion.usage.output_tokens, 2);
    }

    #[test]
    fn base_url_override() {
        let provider = AnthropicProvider::new(reqwest::Client::new(), SecretString::from("k"))
            .with_base_url("http://localhost:8080/".to_string());
        assert_eq!(provider.url(), "http://localhost:8080/v1/messages");
    }
}
