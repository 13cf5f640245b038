use crate::providers::traits::{ChatBackend, ChatMessage};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: Client,
}

// ─── Request Structures ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: Options,
}

#[derive(Debug, Serialize)]
struct Options {
    temperature: f64,
}

// ─── Response Structures ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    /// Some models return a "thinking" field with internal reasoning
    #[serde(default)]
    thinking: Option<String>,
}

// ─── Implementation ───────────────────────────────────────────────────────────

impl OllamaBackend {
    pub fn new(base_url: Option<&str>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.into(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_request(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
    ) -> anyhow::Result<ApiChatResponse> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: Options { temperature },
        };

        let url = format!("{}/api/chat", self.base_url);

        tracing::debug!(
            url = %url,
            model = %self.model,
            message_count = messages.len(),
            temperature,
            "ollama.request"
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Ollama request to {url} failed"))?;
        let status = response.status();
        let body = response.bytes().await?;
        tracing::debug!(status = %status, body_len = body.len(), "ollama.response");

        if !status.is_success() {
            let raw = String::from_utf8_lossy(&body);
            let sanitized = super::sanitize_api_error(&raw);
            tracing::error!(status = %status, body_excerpt = %sanitized, "ollama.error");
            anyhow::bail!("Ollama API error ({status}): {sanitized}");
        }

        match serde_json::from_slice(&body) {
            Ok(r) => Ok(r),
            Err(e) => {
                let raw = String::from_utf8_lossy(&body);
                tracing::error!(
                    error = %e,
                    body_excerpt = %super::sanitize_api_error(&raw),
                    "ollama.decode_failed"
                );
                anyhow::bail!("Failed to parse Ollama response: {e}")
            }
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, messages: &[ChatMessage], temperature: f64) -> anyhow::Result<String> {
        let response = self.send_request(messages, temperature).await?;
        let content = response.message.content;

        // Model stopped after reasoning without producing output.
        if content.is_empty() {
            if let Some(thinking) = &response.message.thinking {
                tracing::warn!(thinking_len = thinking.len(), "ollama.thinking_only");
            } else {
                tracing::warn!("ollama.empty_content");
            }
        }

        Ok(content)
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Ollama not reachable at {}", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Ollama warmup failed ({status})");
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: Option<&str>) -> OllamaBackend {
        OllamaBackend::new(url, "llama3.1", Duration::from_secs(5))
    }

    #[test]
    fn default_url() {
        assert_eq!(backend(None).base_url(), "http://localhost:11434");
    }

    #[test]
    fn custom_url_trailing_slash() {
        let p = backend(Some("http://192.168.1.100:11434/"));
        assert_eq!(p.base_url(), "http://192.168.1.100:11434");
    }

    #[test]
    fn request_serializes_without_streaming() {
        let messages = [ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "llama3.1",
            messages: &messages,
            stream: false,
            options: Options { temperature: 0.2 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["options"]["temperature"], 0.2);
    }

    #[test]
    fn response_deserializes() {
        let json = r#"{"message":{"role":"assistant","content":"Hello from Ollama!"}}"#;
        let resp: ApiChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.message.content, "Hello from Ollama!");
    }

    #[test]
    fn response_with_missing_content_defaults_to_empty() {
        let json = r#"{"message":{"role":"assistant"}}"#;
        let resp: ApiChatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.message.content.is_empty());
    }

    #[test]
    fn response_with_thinking_field_extracts_content() {
        let json =
            r#"{"message":{"role":"assistant","content":"hello","thinking":"internal reasoning"}}"#;
        let resp: ApiChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.message.content, "hello");
        assert_eq!(resp.message.thinking.as_deref(), Some("internal reasoning"));
    }
}
