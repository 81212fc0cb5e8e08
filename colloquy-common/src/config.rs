//! Configuration management for the colloquy service.
//!
//! The service reads a single JSON file at `~/.colloquy/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `COLLOQUY_HOST` → server.host
//! - `COLLOQUY_PORT` → server.port
//! - `CORS_ORIGINS` → server.cors_origins (comma separated)
//! - `COLLOQUY_DB_PATH` → storage.db_path
//! - `OLLAMA_MODEL` → model.model
//! - `OLLAMA_BASE_URL` → model.base_url
//! - `OPENAI_API_KEY` → model.api_key
//! - `COLLOQUY_SYSTEM_PROMPT` → chat.system_prompt
//! - `COLLOQUY_LOG_LEVEL` → observability.log_level
//! - `COLLOQUY_LOG_FORMAT` → observability.log_format

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result, ResultExt};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".colloquy"),
        |dirs| dirs.home_dir().join(".colloquy"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Server Configuration
// ============================================================================

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Default: "127.0.0.1" (local only)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins. Empty means permissive.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    5000
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Conversation database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. `~` is expanded.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a connection waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// Database path with `~` and environment variables expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        match shellexpand::full(&self.db_path) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(shellexpand::tilde(&self.db_path).as_ref()),
        }
    }
}

fn default_db_path() -> String {
    config_dir()
        .join("conversations.db")
        .to_string_lossy()
        .into_owned()
}

fn default_pool_size() -> usize {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

// ============================================================================
// Model Configuration
// ============================================================================

/// Which model backend answers the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama server
    #[default]
    Ollama,
    /// Any OpenAI-compatible chat completions endpoint
    OpenAI,
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend kind
    #[serde(default)]
    pub provider: ProviderKind,

    /// Model name passed to the backend
    #[serde(default = "default_model")]
    pub model: String,

    /// Override the backend base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key (required for the OpenAI backend)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: Option<i64>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for a failed model call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries, doubled per attempt
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_model(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
        }
    }
}

fn default_model() -> String {
    "llama3".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff_ms() -> u64 {
    250
}

// ============================================================================
// Chat Configuration
// ============================================================================

/// How the system instruction relates to the stored conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptPolicy {
    /// Prefixed to every model call, never stored
    #[default]
    Ephemeral,
    /// Stored once as the first message of a session
    PersistOnce,
}

/// Conversation behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Fixed system instruction for the assistant
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Whether the instruction is stored or only sent
    #[serde(default)]
    pub system_prompt_policy: SystemPromptPolicy,

    /// Only the most recent N stored messages are sent to the model
    #[serde(default)]
    pub max_history_messages: Option<usize>,

    /// Sessions expire this many seconds after creation or last touch
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "json" for structured output, anything else for human-readable
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the colloquy service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("COLLOQUY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("COLLOQUY_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid COLLOQUY_PORT"),
            }
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = lookup("COLLOQUY_DB_PATH") {
            self.storage.db_path = path;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.model.model = model;
        }
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            self.model.base_url = Some(url);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(prompt) = lookup("COLLOQUY_SYSTEM_PROMPT") {
            self.chat.system_prompt = Some(prompt);
        }
        if let Some(level) = lookup("COLLOQUY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("COLLOQUY_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Check values that would otherwise fail later at startup or on first request.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".into()));
        }
        if self.storage.pool_size == 0 {
            return Err(Error::Config("storage.pool_size must be at least 1".into()));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(Error::Config(format!(
                "model.temperature {} is outside 0.0..=2.0",
                self.model.temperature
            )));
        }
        if self.model.provider == ProviderKind::OpenAI
            && self.model.api_key.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::Config(
                "model.api_key is required for the openai provider".into(),
            ));
        }
        if self.chat.max_history_messages == Some(0) {
            return Err(Error::Config(
                "chat.max_history_messages must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let dir = config_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .context(format!("Failed to create config directory {}", dir.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let path = config_path();
        fs::write(&path, content)
            .context(format!("Failed to write config to {}", path.display()))
    }

    /// Socket address string for the HTTP listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
