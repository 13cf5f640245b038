use crate::gate::{RetryPolicy, RetryPolicyError};
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema-export", derive(schemars::JsonSchema))]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let chatrelay_dir = home.join(".chatrelay");

        Self {
            workspace_dir: chatrelay_dir.join("workspace"),
            config_path: chatrelay_dir.join("config.toml"),
            delivery: DeliveryConfig::default(),
            gate: GateConfig::default(),
            store: StoreConfig::default(),
            llm: LlmConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

// ── Delivery ──────────────────────────────────────────────────────

/// Debounced delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema-export", derive(schemars::JsonSchema))]
pub struct DeliveryConfig {
    /// Prefix for every coordination store key written by the scheduler.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Added to the delivery delay when computing record TTLs. Must exceed the
    /// task runner's worst-case scheduling latency.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// How long a cancellation marker survives in the store.
    #[serde(default = "default_cancel_marker_ttl_secs")]
    pub cancel_marker_ttl_secs: u64,
    /// Re-runs of a delivery task after a transport failure.
    #[serde(default = "default_send_max_retries")]
    pub send_max_retries: u32,
    /// Fixed delay between transport retries.
    #[serde(default = "default_send_retry_delay_secs")]
    pub send_retry_delay_secs: u64,
}

fn default_key_prefix() -> String {
    "tg:task".into()
}

fn default_grace_period_secs() -> u64 {
    300
}

fn default_cancel_marker_ttl_secs() -> u64 {
    3600
}

fn default_send_max_retries() -> u32 {
    3
}

fn default_send_retry_delay_secs() -> u64 {
    5
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            grace_period_secs: default_grace_period_secs(),
            cancel_marker_ttl_secs: default_cancel_marker_ttl_secs(),
            send_max_retries: default_send_max_retries(),
            send_retry_delay_secs: default_send_retry_delay_secs(),
        }
    }
}

impl DeliveryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn cancel_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.cancel_marker_ttl_secs)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_secs(self.send_retry_delay_secs)
    }
}

// ── Execution gate ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "schema-export", derive(schemars::JsonSchema))]
pub struct GateConfig {
    /// Simultaneous invocations allowed per agent slot.
    #[serde(default = "default_max_concurrent_execute")]
    pub max_concurrent_execute: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_concurrent_execute() -> usize {
    crate::concurrency::DEFAULT_MAX_CONCURRENT_EXECUTE
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_execute: default_max_concurrent_execute(),
            retry: RetryConfig::default(),
        }
    }
}

/// Serialized form of [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "schema-export", derive(schemars::JsonSchema))]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_retry_backoff")]
    pub backoff: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: Option<u64>,
    #[serde(default = "default_retry_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_backoff() -> f64 {
    2.0
}

#[allow(clippy::unnecessary_wraps)]
fn default_retry_max_delay_ms() -> Option<u64> {
    Some(30_000)
}

fn default_retry_jitter_ratio() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
            backoff: default_retry_backoff(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter_ratio: default_retry_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> Result<RetryPolicy, RetryPolicyError> {
        let policy = RetryPolicy {
            max_attempts: self.attempts,
            base_delay: Duration::from_millis(self.delay_ms),
            backoff_multiplier: self.backoff,
            max_delay: self.max_delay_ms.map(Duration::from_millis),
            jitter_ratio: self.jitter_ratio,
        };
        policy.validate()?;
        Ok(policy)
    }
}

// ── Coordination store ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema-export", derive(schemars::JsonSchema))]
pub struct StoreConfig {
    /// "memory" (single process) or "sqlite" (shared between processes on one host)
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// SQLite file; defaults to `<workspace>/coordination.db`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "memory".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

// ── LLM backend ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "schema-export", derive(schemars::JsonSchema))]
pub struct LlmConfig {
    #[serde(default = "default_llm_backend")]
    pub backend: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Authorization key for backends that exchange it for an access token (GigaChat).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Token endpoint override for OAuth-backed backends.
    #[serde(default)]
    pub auth_url: Option<String>,
    /// OAuth scope, e.g. `GIGACHAT_API_PERS`.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_llm_backend() -> String {
    "ollama".into()
}

fn default_llm_model() -> String {
    "llama3.1".into()
}

fn default_llm_temperature() -> f64 {
    0.7
}

fn default_llm_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: default_llm_backend(),
            base_url: None,
            model: default_llm_model(),
            temperature: default_llm_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            api_key: None,
            auth_url: None,
            scope: None,
            max_tokens: None,
        }
    }
}

// ── Observability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema-export", derive(schemars::JsonSchema))]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Load / save ───────────────────────────────────────────────────

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Self::load_or_init_in(&home.join(".chatrelay"))
    }

    /// Load `config.toml` from `dir`, writing defaults first if it does not exist.
    pub fn load_or_init_in(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");

        if !dir.exists() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
            fs::create_dir_all(dir.join("workspace"))
                .context("Failed to create workspace directory")?;
        }

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.workspace_dir = dir.join("workspace");
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path;
            config.workspace_dir = dir.join("workspace");
            config.save()?;
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `CHATRELAY_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(backend) = non_empty("CHATRELAY_LLM_BACKEND") {
            self.llm.backend = backend;
        }
        if let Some(model) = non_empty("CHATRELAY_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = non_empty("CHATRELAY_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Some(key) = non_empty("CHATRELAY_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(limit) = non_empty("CHATRELAY_MAX_CONCURRENT_EXECUTE") {
            if let Ok(limit) = limit.parse::<usize>() {
                if limit > 0 {
                    self.gate.max_concurrent_execute = limit;
                }
            }
        }
        if let Some(backend) = non_empty("CHATRELAY_STORE_BACKEND") {
            self.store.backend = backend;
        }
        if let Some(level) = non_empty("CHATRELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// SQLite path for the coordination store.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join("coordination.db"))
    }

    #[cfg(feature = "schema-export")]
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}
