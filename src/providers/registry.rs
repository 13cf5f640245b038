use super::gigachat::GigaChatBackend;
use super::ollama::OllamaBackend;
use super::traits::ChatBackend;
use crate::config::LlmConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Constructor stored in a [`BackendRegistry`].
pub type BackendFactory = fn(&LlmConfig) -> anyhow::Result<Arc<dyn ChatBackend>>;

/// Maps backend identifiers to constructors. Populated explicitly at startup.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("ollama", ollama_factory);
        registry.register("gigachat", gigachat_factory);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the backend selected by `config.backend`.
    pub fn create(&self, config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatBackend>> {
        let key = config.backend.trim().to_ascii_lowercase();
        match self.factories.get(&key) {
            Some(factory) => factory(config),
            None => anyhow::bail!(
                "Unknown LLM backend: {}. Registered backends: {}",
                config.backend,
                self.names().join(", ")
            ),
        }
    }
}

fn ollama_factory(config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatBackend>> {
    Ok(Arc::new(OllamaBackend::new(
        config.base_url.as_deref().filter(|u| !u.is_empty()),
        config.model.clone(),
        Duration::from_secs(config.timeout_secs.max(1)),
    )))
}

fn gigachat_factory(config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatBackend>> {
    let Some(auth_key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
        anyhow::bail!("GigaChat backend requires llm.api_key (or CHATRELAY_LLM_API_KEY)");
    };
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let mut backend = GigaChatBackend::new(auth_key, config.model.clone(), timeout)
        .with_max_tokens(config.max_tokens);
    if let Some(url) = config.base_url.as_deref().filter(|u| !u.is_empty()) {
        backend = backend.with_base_url(url);
    }
    if let Some(url) = config.auth_url.as_deref().filter(|u| !u.is_empty()) {
        backend = backend.with_auth_url(url);
    }
    if let Some(scope) = config.scope.as_deref().filter(|s| !s.is_empty()) {
        backend = backend.with_scope(scope);
    }
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;
    use async_trait::async_trait;

    struct CannedBackend;

    #[async_trait]
    impl ChatBackend for CannedBackend {
        fn name(&self) -> &str {
            "canned"
        }

        async fn chat(&self, _messages: &[ChatMessage], _t: f64) -> anyhow::Result<String> {
            Ok("canned reply".into())
        }
    }

    fn canned_factory(_config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatBackend>> {
        Ok(Arc::new(CannedBackend))
    }

    #[test]
    fn builtin_registry_creates_ollama() {
        let registry = BackendRegistry::with_builtin();
        let backend = registry.create(&LlmConfig::default()).unwrap();
        assert_eq!(backend.name(), "ollama");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = BackendRegistry::with_builtin();
        let config = LlmConfig {
            backend: "Ollama".into(),
            ..LlmConfig::default()
        };
        assert!(registry.contains("OLLAMA"));
        assert!(registry.create(&config).is_ok());
    }

    #[test]
    fn unknown_backend_lists_registered_names() {
        let registry = BackendRegistry::with_builtin();
        let config = LlmConfig {
            backend: "yandexgpt".into(),
            ..LlmConfig::default()
        };
        let err = registry.create(&config).err().unwrap().to_string();
        assert!(err.contains("yandexgpt"));
        assert!(err.contains("gigachat, ollama"));
    }

    #[test]
    fn gigachat_needs_an_auth_key() {
        let registry = BackendRegistry::with_builtin();
        let mut config = LlmConfig {
            backend: "gigachat".into(),
            model: "GigaChat".into(),
            ..LlmConfig::default()
        };
        let err = registry.create(&config).err().unwrap().to_string();
        assert!(err.contains("api_key"));

        config.api_key = Some("c2VjcmV0".into());
        assert_eq!(registry.create(&config).unwrap().name(), "gigachat");
    }

    #[tokio::test]
    async fn custom_backends_can_be_registered() {
        let mut registry = BackendRegistry::new();
        assert!(registry.names().is_empty());
        registry.register("canned", canned_factory);

        let config = LlmConfig {
            backend: "canned".into(),
            ..LlmConfig::default()
        };
        let backend = registry.create(&config).unwrap();
        let reply = backend.chat(&[ChatMessage::user("hi")], 0.0).await.unwrap();
        assert_eq!(reply, "canned reply");
    }
}
