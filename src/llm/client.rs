use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::error::LlmError;
use super::LlmClient;
use crate::config::{LlmConfig, LlmProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Talks to OpenAI-compatible, Anthropic and Ollama endpoints over HTTP
pub struct HttpLlmClient {
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_headers(config: &LlmConfig) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let api_key = || {
            config
                .api_key
                .as_deref()
                .filter(|key| !key.is_empty())
                .ok_or_else(|| LlmError::MissingApiKey {
                    provider: config.provider.as_str().to_string(),
                })
        };
        let header_value =
            |value: &str| HeaderValue::from_str(value).map_err(|e| LlmError::Http(e.to_string()));

        match config.provider {
            LlmProvider::OpenAi => {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", api_key()?))?);
            }
            LlmProvider::Anthropic => {
                headers.insert("x-api-key", header_value(api_key()?)?);
                headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            }
            LlmProvider::Ollama => {}
        }
        Ok(headers)
    }

    fn build_request(prompt: &str, config: &LlmConfig) -> (String, Value) {
        let base = config.endpoint();
        match config.provider {
            LlmProvider::OpenAi => (
                format!("{base}/chat/completions"),
                json!({
                    "model": config.model,
                    "messages": [{"role": "user", "content": prompt}],
                    "temperature": config.temperature,
                    "max_tokens": config.max_tokens,
                }),
            ),
            LlmProvider::Anthropic => (
                format!("{base}/messages"),
                json!({
                    "model": config.model,
                    "messages": [{"role": "user", "content": prompt}],
                    "temperature": config.temperature,
                    "max_tokens": config.max_tokens,
                }),
            ),
            LlmProvider::Ollama => (
                format!("{base}/api/generate"),
                json!({
                    "model": config.model,
                    "prompt": prompt,
                    "stream": false,
                    "options": {"temperature": config.temperature},
                }),
            ),
        }
    }

    fn parse_response(provider: LlmProvider, body: &Value) -> Result<String, LlmError> {
        let text = match provider {
            LlmProvider::OpenAi => body
                .get("choices")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str()),
            LlmProvider::Anthropic => body
                .get("content")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.iter().find(|block| block.get("type").and_then(|t| t.as_str()) == Some("text")))
                .and_then(|block| block.get("text"))
                .and_then(|v| v.as_str()),
            LlmProvider::Ollama => body.get("response").and_then(|v| v.as_str()),
        };

        text.map(str::to_string).ok_or_else(|| {
            LlmError::MalformedResponse(format!(
                "no completion text in {} response",
                provider.as_str()
            ))
        })
    }
}

impl Default for HttpLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, config: &LlmConfig) -> Result<String, LlmError> {
        let headers = Self::build_headers(config)?;
        let (url, payload) = Self::build_request(prompt, config);
        debug!(provider = config.provider.as_str(), model = %config.model, %url, "Sending LLM request");

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        seconds: config.timeout_seconds,
                    }
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        Self::parse_response(config.provider, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn llm_config(provider: LlmProvider, server: &MockServer) -> LlmConfig {
        let mut config = AgentConfig::default().llm;
        config.provider = provider;
        config.api_key = Some("test-key".to_string());
        config.base_url = Some(server.uri());
        config.timeout_seconds = 5;
        config
    }

    #[tokio::test]
    async fn test_openai_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"model": "gpt-4-turbo-preview"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"nodes\": 3}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpLlmClient::new();
        let text = client
            .complete("optimize", &llm_config(LlmProvider::OpenAi, &server))
            .await
            .unwrap();
        assert_eq!(text, "{\"nodes\": 3}");
    }

    #[tokio::test]
    async fn test_anthropic_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "hello"}]
            })))
            .mount(&server)
            .await;

        let text = HttpLlmClient::new()
            .complete("hi", &llm_config(LlmProvider::Anthropic, &server))
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_ollama_needs_no_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "ok"})))
            .mount(&server)
            .await;

        let mut config = llm_config(LlmProvider::Ollama, &server);
        config.api_key = None;
        let text = HttpLlmClient::new().complete("hi", &config).await.unwrap();
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let err = HttpLlmClient::new()
            .complete("hi", &llm_config(LlmProvider::OpenAi, &server))
            .await
            .unwrap_err();
        match err {
            LlmError::Status { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = HttpLlmClient::new()
            .complete("hi", &llm_config(LlmProvider::OpenAi, &server))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_sending() {
        let server = MockServer::start().await;
        let mut config = llm_config(LlmProvider::OpenAi, &server);
        config.api_key = None;

        let err = HttpLlmClient::new().complete("hi", &config).await.unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey { .. }));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(json!({"response": "late"})),
            )
            .mount(&server)
            .await;

        let mut config = llm_config(LlmProvider::Ollama, &server);
        config.timeout_seconds = 1;
        let err = HttpLlmClient::new().complete("hi", &config).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout { seconds: 1 }));
    }
}
