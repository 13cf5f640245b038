use crate::config::{Config, LlmConfig};
use crate::gate::{AgentRole, AgentSlot, PermanentFailure, RetryPolicyError};
use crate::providers::{BackendRegistry, ChatBackend, ChatMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const DIALOG_SYSTEM_PROMPT: &str = "You are a helpful assistant replying to a customer in a chat. \
Answer briefly and stay on the customer's topic.";

const SUMMARY_SYSTEM_PROMPT: &str = "Summarize the conversation so far in a few sentences. \
Keep names, dates and open questions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Dialog,
    Summary,
}

impl AgentKind {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Dialog => "DIALOG AGENT",
            Self::Summary => "SUMMARY AGENT",
        }
    }

    fn default_system_prompt(self) -> &'static str {
        match self {
            Self::Dialog => DIALOG_SYSTEM_PROMPT,
            Self::Summary => SUMMARY_SYSTEM_PROMPT,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Input to a chat agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Free-form facts about the client, rendered ahead of the message.
    #[serde(default)]
    pub client_info: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    pub message: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_client_info(mut self, info: impl Into<String>) -> Self {
        self.client_info = Some(info.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }
}

/// Agent role backed by a [`ChatBackend`] chosen through the registry.
pub struct ChatRole {
    kind: AgentKind,
    system_prompt: String,
    llm: LlmConfig,
    registry: BackendRegistry,
}

impl ChatRole {
    pub fn new(kind: AgentKind, llm: LlmConfig, registry: BackendRegistry) -> Self {
        Self {
            kind,
            system_prompt: kind.default_system_prompt().to_string(),
            llm,
            registry,
        }
    }

    pub fn dialog(llm: LlmConfig, registry: BackendRegistry) -> Self {
        Self::new(AgentKind::Dialog, llm, registry)
    }

    pub fn summary(llm: LlmConfig, registry: BackendRegistry) -> Self {
        Self::new(AgentKind::Summary, llm, registry)
    }

    /// Replace the built-in system prompt. An empty prompt sends none.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    fn render_user_message(request: &ChatRequest) -> String {
        match request.client_info.as_deref().map(str::trim) {
            Some(info) if !info.is_empty() => {
                format!("Client information:\n{info}\n\nNew message: {}", request.message)
            }
            _ => request.message.clone(),
        }
    }
}

#[async_trait]
impl AgentRole for ChatRole {
    type Runnable = Arc<dyn ChatBackend>;
    type Request = ChatRequest;
    type Input = Vec<ChatMessage>;
    type Raw = String;
    type Response = String;

    fn name(&self) -> &str {
        self.kind.display_name()
    }

    async fn build_runnable(&self) -> anyhow::Result<Arc<dyn ChatBackend>> {
        let backend = self.registry.create(&self.llm)?;
        if let Err(e) = backend.warmup().await {
            tracing::warn!(
                agent = self.name(),
                backend = backend.name(),
                error = %format!("{e:#}"),
                "agent.warmup_failed"
            );
        }
        Ok(backend)
    }

    fn transform(&self, request: &ChatRequest) -> anyhow::Result<Vec<ChatMessage>> {
        if request.message.trim().is_empty() {
            return Err(PermanentFailure::new("message must not be empty").into());
        }
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(request.history.iter().cloned());
        messages.push(ChatMessage::user(Self::render_user_message(request)));
        Ok(messages)
    }

    async fn invoke(
        &self,
        runnable: &Arc<dyn ChatBackend>,
        input: Vec<ChatMessage>,
    ) -> anyhow::Result<String> {
        runnable.chat(&input, self.llm.temperature).await
    }

    fn extract_response(&self, raw: String) -> anyhow::Result<String> {
        let reply = raw.trim();
        if reply.is_empty() {
            return Err(PermanentFailure::new(format!("{} returned an empty reply", self.name())).into());
        }
        Ok(reply.to_string())
    }
}

/// Gated chat agent.
pub type ChatSlot = AgentSlot<ChatRole>;

/// Build the slot for `kind` from the `[llm]` and `[gate]` sections.
pub fn build_chat_slot(
    kind: AgentKind,
    config: &Config,
    registry: BackendRegistry,
) -> Result<ChatSlot, RetryPolicyError> {
    AgentSlot::from_config(
        ChatRole::new(kind, config.llm.clone(), registry),
        &config.gate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{classify_error, ErrorClass, ExecutionError, RetryPolicy};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Records the last request and replays scripted replies.
    struct ScriptedBackend {
        replies: Mutex<Vec<anyhow::Result<String>>>,
        last_messages: Mutex<Vec<ChatMessage>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, messages: &[ChatMessage], _t: f64) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock() = messages.to_vec();
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                Ok("default reply".into())
            } else {
                replies.remove(0)
            }
        }
    }

    fn role() -> ChatRole {
        ChatRole::dialog(LlmConfig::default(), BackendRegistry::with_builtin())
    }

    #[test]
    fn kinds_have_display_names() {
        assert_eq!(AgentKind::Dialog.to_string(), "DIALOG AGENT");
        assert_eq!(AgentKind::Summary.display_name(), "SUMMARY AGENT");
        assert_eq!(role().name(), "DIALOG AGENT");
    }

    #[test]
    fn transform_orders_system_history_user() {
        let request = ChatRequest::new("where is my order?")
            .with_client_info("name: Ann")
            .with_history(vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]);

        let messages = role().transform(&request).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].role, "user");
        assert!(messages[3].content.contains("name: Ann"));
        assert!(messages[3].content.ends_with("New message: where is my order?"));
    }

    #[test]
    fn empty_system_prompt_is_omitted() {
        let role = role().with_system_prompt("");
        let messages = role.transform(&ChatRequest::new("ping")).unwrap();
        assert_eq!(messages, vec![ChatMessage::user("ping")]);
    }

    #[test]
    fn empty_message_is_fatal() {
        let err = role().transform(&ChatRequest::new("   ")).unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::Fatal);
    }

    #[test]
    fn extract_trims_and_rejects_empty() {
        let role = role();
        assert_eq!(role.extract_response("  ok \n".into()).unwrap(), "ok");
        let err = role.extract_response("   ".into()).unwrap_err();
        assert_eq!(role.classify_error(&err), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn build_fails_for_unregistered_backend() {
        let llm = LlmConfig {
            backend: "yandexgpt".into(),
            ..LlmConfig::default()
        };
        let slot = AgentSlot::new(
            ChatRole::summary(llm, BackendRegistry::with_builtin()),
            1,
            RetryPolicy::fixed(1, Duration::ZERO),
        )
        .unwrap();
        let err = slot.execute(&ChatRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Initialization { .. }));
        assert_eq!(err.agent(), "SUMMARY AGENT");
    }

    #[tokio::test]
    async fn invoke_passes_transformed_messages_to_backend() {
        let backend = Arc::new(ScriptedBackend {
            replies: Mutex::new(vec![
                Err(anyhow::anyhow!("503 Service Unavailable")),
                Ok("  sure thing  ".into()),
            ]),
            last_messages: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        });
        let role = role();
        let runnable: Arc<dyn ChatBackend> = backend.clone();

        let input = role.transform(&ChatRequest::new("help")).unwrap();
        let first = role.invoke(&runnable, input.clone()).await.unwrap_err();
        assert_eq!(role.classify_error(&first), ErrorClass::Transient);

        let raw = role.invoke(&runnable, input).await.unwrap();
        assert_eq!(role.extract_response(raw).unwrap(), "sure thing");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.last_messages.lock().last().unwrap().content, "help");
    }

    #[test]
    fn slot_is_built_from_config() {
        let config = Config::default();
        let slot = build_chat_slot(AgentKind::Dialog, &config, BackendRegistry::with_builtin())
            .unwrap();
        assert_eq!(slot.name(), "DIALOG AGENT");
        assert_eq!(slot.concurrency_limit(), config.gate.max_concurrent_execute);
    }
}
