//! Configuration for the relay bot.
//!
//! Loaded from `~/.relay-bot/config.json` when present, then overridden by
//! environment variables:
//!
//! ## Secrets
//! - `ENCRYPTION_KEY` → encryption_key (required, 256 bits)
//! - `DISCORD_TOKEN` → bot.token (required to connect)
//!
//! ## Platform
//! - `DISCORD_APPLICATION_ID` → bot.application_id
//! - `DISCORD_GUILD_ID` → bot.guild_id
//!
//! ## Storage
//! - `USER_DATA_PATH` → store.path
//!
//! ## Completion backend
//! - `OPENAI_BASE_URL` → completion.base_url
//! - `OPENAI_MODEL` → completion.model
//!
//! ## Observability
//! - `RELAY_LOG_LEVEL` → observability.log_level
//! - `RELAY_LOG_FORMAT` → observability.log_format

use crate::error::Error;
use crate::security::EncryptionKey;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".relay-bot"),
        |dirs| dirs.home_dir().join(".relay-bot"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Bot (messaging platform)
// ============================================================================

/// Messaging platform settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Bot token used for the gateway and REST API
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Application ID for command registration and interaction webhooks.
    /// Derived from the token when absent.
    #[serde(default)]
    pub application_id: Option<String>,

    /// Register commands to one guild instead of globally
    #[serde(default)]
    pub guild_id: Option<String>,

    /// Overwrite the application's commands on startup
    #[serde(default = "default_true")]
    pub register_commands: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: None,
            application_id: None,
            guild_id: None,
            register_commands: true,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Durable user store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the JSON user store; `~` is expanded
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    /// Resolve the store path, falling back to `~/.relay-bot/users.json`.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).into_owned()),
            None => config_dir().join("users.json"),
        }
    }
}

// ============================================================================
// Completion backend
// ============================================================================

fn default_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_model() -> String {
    "gpt-3.5-turbo".into()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Chat-completion backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_announcement_ttl_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    32
}

/// Chat session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session length, measured from session start
    #[serde(default = "default_session_timeout_secs")]
    pub timeout_secs: u64,

    /// How long the session announcement stays visible
    #[serde(default = "default_announcement_ttl_secs")]
    pub announcement_ttl_secs: u64,

    /// Buffered messages per session before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn announcement_ttl(&self) -> Duration {
        Duration::from_secs(self.announcement_ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout_secs(),
            announcement_ttl_secs: default_announcement_ttl_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

// ============================================================================
// Observability
// ============================================================================

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
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

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Process-wide key for stored credentials. Never written back out.
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,
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
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }
        if let Some(token) = lookup("DISCORD_TOKEN") {
            self.bot.token = Some(token);
        }
        if let Some(id) = lookup("DISCORD_APPLICATION_ID") {
            self.bot.application_id = Some(id);
        }
        if let Some(id) = lookup("DISCORD_GUILD_ID") {
            self.bot.guild_id = Some(id);
        }
        if let Some(path) = lookup("USER_DATA_PATH") {
            self.store.path = Some(path);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.completion.base_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.completion.model = model;
        }
        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("RELAY_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Parse the configured encryption key.
    pub fn encryption_key(&self) -> crate::Result<EncryptionKey> {
        let raw = self
            .encryption_key
            .as_deref()
            .ok_or_else(|| Error::Config("ENCRYPTION_KEY is not set".into()))?;
        EncryptionKey::parse(raw)
    }

    /// Get the platform token.
    pub fn bot_token(&self) -> crate::Result<&str> {
        self.bot
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Config("DISCORD_TOKEN is not set".into()))
    }

    /// Check everything that must be right before the bot starts.
    pub fn validate(&self) -> crate::Result<EncryptionKey> {
        let key = self.encryption_key()?;
        self.bot_token()?;
        if self.session.timeout_secs == 0 {
            return Err(Error::Config("session.timeout_secs must be positive".into()));
        }
        if self.session.queue_capacity == 0 {
            return Err(Error::Config("session.queue_capacity must be positive".into()));
        }
        Ok(key)
    }
}
