use crate::providers::traits::{ChatBackend, ChatMessage};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_BASE_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";
pub const DEFAULT_AUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
pub const DEFAULT_SCOPE: &str = "GIGACHAT_API_PERS";

/// Tokens this close to expiry are refreshed before use.
const TOKEN_REFRESH_MARGIN_MS: i64 = 60_000;

/// GigaChat chat-completions backend.
///
/// The configured authorization key is exchanged for a short-lived access
/// token, which is cached and refreshed shortly before it expires or when the
/// API rejects it.
pub struct GigaChatBackend {
    base_url: String,
    auth_url: String,
    auth_key: String,
    scope: String,
    model: String,
    max_tokens: Option<u32>,
    client: Client,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    /// Unix milliseconds.
    expires_at: i64,
}

impl AccessToken {
    fn is_fresh(&self, now_ms: i64) -> bool {
        self.expires_at - TOKEN_REFRESH_MARGIN_MS > now_ms
    }
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

impl GigaChatBackend {
    pub fn new(auth_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            auth_key: auth_key.into(),
            scope: DEFAULT_SCOPE.to_string(),
            model: model.into(),
            max_tokens: None,
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            token: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_auth_url(mut self, url: &str) -> Self {
        self.auth_url = url.to_string();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Cached access token, fetching a new one when missing or about to expire.
    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.token.lock().await;
        let now = Utc::now().timestamp_millis();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.value.clone());
        }
        let token = self.fetch_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn fetch_token(&self) -> anyhow::Result<AccessToken> {
        let response = self
            .client
            .post(&self.auth_url)
            .header("Authorization", format!("Basic {}", self.auth_key))
            .header("RqUID", uuid::Uuid::new_v4().to_string())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(format!("scope={}", self.scope))
            .send()
            .await
            .with_context(|| format!("GigaChat token request to {} failed", self.auth_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let sanitized = super::sanitize_api_error(&body);
            tracing::error!(status = %status, body_excerpt = %sanitized, "gigachat.auth_error");
            anyhow::bail!("GigaChat auth error ({status}): {sanitized}");
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse GigaChat token response")?;
        tracing::debug!(expires_at = token.expires_at, "gigachat.token_refreshed");
        Ok(AccessToken {
            value: token.access_token,
            expires_at: token.expires_at,
        })
    }

    async fn post_completion(
        &self,
        token: &str,
        request: &CompletionRequest<'_>,
    ) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(
            url = %url,
            model = %self.model,
            message_count = request.messages.len(),
            "gigachat.request"
        );
        self.client
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .with_context(|| format!("GigaChat request to {url} failed"))
    }
}

#[async_trait]
impl ChatBackend for GigaChatBackend {
    fn name(&self) -> &str {
        "gigachat"
    }

    async fn chat(&self, messages: &[ChatMessage], temperature: f64) -> anyhow::Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let token = self.access_token().await?;
        let mut response = self.post_completion(&token, &request).await?;

        // Tokens can be revoked server-side before their stated expiry.
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("gigachat.token_rejected");
            self.invalidate_token().await;
            let token = self.access_token().await?;
            response = self.post_completion(&token, &request).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let sanitized = super::sanitize_api_error(&body);
            tracing::error!(status = %status, body_excerpt = %sanitized, "gigachat.error");
            anyhow::bail!("GigaChat API error ({status}): {sanitized}");
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse GigaChat response")?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No choices in GigaChat response"))
    }

    /// Exchanges the authorization key, which fails fast on bad credentials.
    async fn warmup(&self) -> anyhow::Result<()> {
        self.access_token().await.map(|_| ())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_public_endpoints() {
        let backend = GigaChatBackend::new("key", "GigaChat", Duration::from_secs(5));
        assert_eq!(backend.base_url(), DEFAULT_BASE_URL);
        assert_eq!(backend.scope, "GIGACHAT_API_PERS");
        assert_eq!(backend.model(), "GigaChat");
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let backend = GigaChatBackend::new("key", "GigaChat", Duration::from_secs(5))
            .with_base_url("http://localhost:9000/api/v1/");
        assert_eq!(backend.base_url(), "http://localhost:9000/api/v1");
    }

    #[test]
    fn request_omits_unset_max_tokens() {
        let messages = [ChatMessage::user("hi")];
        let request = CompletionRequest {
            model: "GigaChat",
            messages: &messages,
            temperature: 0.7,
            max_tokens: None,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["content"], "hi");
    }

    #[test]
    fn response_reads_first_choice() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Привет"},"index":0}]}"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices[0].message.content, "Привет");
    }

    #[test]
    fn token_freshness_keeps_a_margin() {
        let token = AccessToken {
            value: "t".into(),
            expires_at: 1_000_000,
        };
        assert!(token.is_fresh(1_000_000 - TOKEN_REFRESH_MARGIN_MS - 1));
        assert!(!token.is_fresh(1_000_000 - TOKEN_REFRESH_MARGIN_MS));
        assert!(!token.is_fresh(2_000_000));
    }
}
