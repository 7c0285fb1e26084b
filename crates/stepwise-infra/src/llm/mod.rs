//! HTTP clients for the model providers reachable from the `model_call` tool.
//!
//! - `anthropic`: Anthropic Messages API
//! - `openai_compat`: OpenAI chat completions, also used for Gemini, DeepSeek
//!   and Mistral through their OpenAI-compatible endpoints

pub mod anthropic;
pub mod openai_compat;

use std::time::Duration;

use secrecy::SecretString;
use stepwise_core::llm::{BoxLlmProvider, ProviderFactory};
use stepwise_types::llm::{LlmError, ProviderKind};

use self::anthropic::AnthropicProvider;
use self::openai_compat::{OpenAiCompatConfig, OpenAiCompatibleProvider};

/// Request timeout for a single completion.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Builds reqwest-backed providers for every [`ProviderKind`].
#[derive(Debug, Clone, Default)]
pub struct HttpProviderFactory {
    /// Overrides every provider's base URL (tests, proxies).
    base_url: Option<String>,
}

impl HttpProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, kind: ProviderKind, api_key: String) -> Result<BoxLlmProvider, LlmError> {
        let client = http_client()?;
        let api_key = SecretString::from(api_key);

        let provider = match kind {
            ProviderKind::Anthropic => {
                let mut provider = AnthropicProvider::new(client, api_key);
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                BoxLlmProvider::new(provider)
            }
            other => {
                let mut config = OpenAiCompatConfig::for_kind(other);
                if let Some(url) = &self.base_url {
                    config.base_url = url.clone();
                }
                BoxLlmProvider::new(OpenAiCompatibleProvider::new(client, api_key, config))
            }
        };
        tracing::debug!(provider = provider.name(), "built llm provider");
        Ok(provider)
    }
}

fn http_client() -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| LlmError::Provider {
            message: format!("failed to create HTTP client: {e}"),
        })
}

/// Map a non-success HTTP status to the matching [`LlmError`].
pub(crate) fn status_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: String) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::AuthenticationFailed,
        429 => LlmError::RateLimited {
            retry_after_ms: retry_after.map(|secs| secs * 1000),
        },
        529 | 503 => LlmError::Overloaded(body),
        400 | 404 | 422 => LlmError::InvalidRequest(format!("HTTP {status}: {body}")),
        _ => LlmError::Provider {
            message: format!("HTTP {status}: {body}"),
        },
    }
}

/// `Retry-After` in whole seconds, if present.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn builds_every_kind() {
        let factory = HttpProviderFactory::new();
        for kind in ProviderKind::ALL {
            let provider = factory.build(kind, "test-key".to_string()).unwrap();
            assert_eq!(provider.name(), kind.as_str());
        }
    }

    #[test]
    fn maps_status_codes() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, String::new()),
            LlmError::AuthenticationFailed
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some(2), String::new()),
            LlmError::RateLimited { retry_after_ms: Some(2000) }
        ));
        assert!(matches!(
            status_error(StatusCode::from_u16(529).unwrap(), None, "busy".into()),
            LlmError::Overloaded(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, None, "bad".into()),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR, None, String::new()),
            LlmError::Provider { .. }
        ));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(7));
    }
}
