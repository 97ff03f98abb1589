use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::ChorusError;

#[derive(Debug, Deserialize, Clone)]
pub struct ChorusConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8780,
        }
    }
}

/// Hop loop settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    /// Hop depth at which a recursive chain stops.
    pub max_recursion: u32,
    pub message_ttl_days: i64,
    /// Number of prior session messages handed to the agent as history.
    pub history_limit: u32,
    /// Honour a leading "Hey <Name>," in agent output as the next addressee.
    pub addressee_override: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_recursion: 10,
            message_ttl_days: 30,
            history_limit: 20,
            addressee_override: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub visibility_timeout_seconds: i64,
    /// A message received this many times without success is dead-lettered.
    pub max_receive_count: i32,
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 5,
            visibility_timeout_seconds: 300,
            max_receive_count: 2,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub classifier_model: String,
    pub default_model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_tool_rounds() -> usize {
    3
}

fn default_timeout_seconds() -> u64 {
    60
}

impl LlmConfig {
    pub fn api_key(&self) -> String {
        std::env::var(&self.api_key_env).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Bearer token -> user identity.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ToolsConfig {
    /// Tool name (e.g. `post_tweet`) -> endpoint URL.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
        }
    }
}

impl ChorusConfig {
    /// Load from a TOML file, then apply `CHORUS__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("CHORUS").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ChorusError> {
        let invalid = |msg: &str| Err(ChorusError::InvalidConfig(msg.to_string()));
        if self.queue.batch_size == 0 {
            return invalid("queue.batch_size must be at least 1");
        }
        if self.queue.max_receive_count < 1 {
            return invalid("queue.max_receive_count must be at least 1");
        }
        if self.queue.visibility_timeout_seconds < 1 {
            return invalid("queue.visibility_timeout_seconds must be positive");
        }
        if self.dispatch.message_ttl_days < 1 {
            return invalid("dispatch.message_ttl_days must be positive");
        }
        if self.llm.base_url.trim().is_empty() {
            return invalid("llm.base_url must be set");
        }
        Ok(())
    }

    /// Parse from an in-memory TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}
