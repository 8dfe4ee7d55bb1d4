//! Configuration management for tgfilestream

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-client concurrent download limit
pub const DEFAULT_REQUEST_LIMIT: usize = 5;

/// Default largest file the server will stream: 20MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Default per-partition connection limit
pub const DEFAULT_CONNECTION_LIMIT: usize = 20;

/// Minimum alignment of a chunk request (4KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024;

/// Size of a regular chunk request (512KB)
pub const DEFAULT_CHUNK_SIZE: u32 = 512 * 1024;

/// Largest chunk the upstream accepts (1MB)
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Token and delete-key secrets
    pub security: SecurityConfig,

    /// Connection pool configuration
    pub pool: PoolConfig,

    /// Chunked transfer configuration
    pub transfer: TransferConfig,

    /// Telegram credentials handed to the protocol client
    pub telegram: TelegramConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Public URL prefix used when printing links
    pub link_prefix: Option<String>,

    /// Maximum in-flight GET requests per client IP
    pub request_limit: usize,

    /// Largest file that will be served (None = unlimited)
    pub max_file_size: Option<u64>,

    /// Take the client IP from X-Forwarded-For
    pub trust_forwarded_headers: bool,

    /// Serve a small index page at `/`
    pub show_index: bool,
}

/// Secrets
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Pre-shared secret for resource tokens
    pub token_secret: String,

    /// Shared secret required by DELETE (None disables deletion)
    pub delete_key: Option<String>,

    /// Header carrying the delete key
    pub delete_key_header: String,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live connections per partition
    pub connections_per_partition: usize,

    /// Idle connections older than this are closed (seconds)
    pub idle_timeout_secs: u64,
}

/// Chunked transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk offsets must be multiples of this (bytes)
    pub block_size: u32,

    /// Size of a regular chunk request (bytes)
    pub chunk_size: u32,

    /// Upper bound on a chunk request (bytes)
    pub max_chunk_size: u32,

    /// Chunk requests kept in flight per connection
    pub pipeline_depth: usize,

    /// Connections a single download may hold
    pub connections_per_session: usize,

    /// Cap on in-flight plus buffered chunks per download
    pub max_buffered_chunks: usize,

    /// Retry attempts for a failing chunk
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,

    /// Timeout for a single chunk request (seconds)
    pub chunk_timeout_secs: u64,
}

/// Telegram API configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Telegram API ID (get from my.telegram.org)
    pub api_id: i32,

    /// Telegram API hash
    pub api_hash: String,

    /// Bot token from @BotFather
    pub bot_token: String,

    /// Session file path
    pub session_file: PathBuf,

    /// Retry attempts for metadata lookups
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            link_prefix: None,
            request_limit: DEFAULT_REQUEST_LIMIT,
            max_file_size: Some(DEFAULT_MAX_FILE_SIZE),
            trust_forwarded_headers: false,
            show_index: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            token_secret: String::new(),
            delete_key: None,
            delete_key_header: "x-web-api-key".to_string(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            connections_per_partition: DEFAULT_CONNECTION_LIMIT,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            pipeline_depth: 2,
            connections_per_session: 4,
            max_buffered_chunks: 8,
            retry_attempts: 3,
            retry_base_delay_ms: 250,
            chunk_timeout_secs: 30,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        let session_file = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tgfilestream")
            .join("bot.session");

        TelegramConfig {
            api_id: 0,
            api_hash: String::new(),
            bot_token: String::new(),
            session_file,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("token_secret", &"<redacted>")
            .field("delete_key", &self.delete_key.as_ref().map(|_| "<redacted>"))
            .field("delete_key_header", &self.delete_key_header)
            .finish()
    }
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("bot_token", &"<redacted>")
            .field("session_file", &self.session_file)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .finish()
    }
}

impl ServerConfig {
    /// Public URL prefix, falling back to the bind address
    pub fn link_prefix(&self) -> String {
        match &self.link_prefix {
            Some(prefix) => prefix.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl TransferConfig {
    /// Chunk timeout as a Duration
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise from the environment alone
    pub fn load_or_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().is_file() {
            Self::load(path)
        } else {
            Self::from_env()
        }
    }

    /// Create a new config from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            var(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(port) = get("PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(prefix) = get("LINK_PREFIX") {
            self.server.link_prefix = Some(prefix);
        }
        if let Some(show) = get("SHOW_INDEX") {
            self.server.show_index = show != "0";
        }
        if let Some(size) = get("MAX_FILE_SIZE").and_then(|v| v.parse::<i64>().ok()) {
            self.server.max_file_size = u64::try_from(size).ok();
        }
        if let Some(limit) = get("REQUEST_LIMIT").and_then(|v| v.parse::<usize>().ok()) {
            self.server.request_limit = limit;
        }
        if let Some(limit) = get("CONNECTION_LIMIT").and_then(|v| v.parse::<usize>().ok()) {
            self.pool.connections_per_partition = limit;
        }

        if let Some(secret) = get("TOKEN_SECRET") {
            self.security.token_secret = secret;
        }
        if let Some(key) = get("WEB_API_KEY") {
            self.security.delete_key = Some(key);
        }

        if let Some(id) = get("TG_API_ID").and_then(|v| v.parse::<i32>().ok()) {
            self.telegram.api_id = id;
        }
        if let Some(hash) = get("TG_API_HASH") {
            self.telegram.api_hash = hash;
        }
        if let Some(token) = get("TG_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }

        if let Some(debug) = get("DEBUG") {
            if debug != "0" {
                self.logging.level = "debug".to_string();
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::InvalidConfig("Port must be between 1 and 65535".to_string()));
        }

        if self.server.request_limit == 0 {
            return Err(Error::InvalidConfig(
                "Request limit must be greater than 0".to_string(),
            ));
        }

        if self.security.token_secret.is_empty() {
            return Err(Error::InvalidConfig(
                "Token secret is required (TOKEN_SECRET)".to_string(),
            ));
        }

        if self.security.delete_key_header.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "Delete key header name must not be empty".to_string(),
            ));
        }

        if self.pool.connections_per_partition == 0 {
            return Err(Error::InvalidConfig(
                "Connections per partition must be greater than 0".to_string(),
            ));
        }

        self.transfer.validate()
    }
}

impl TransferConfig {
    /// Validate chunk layout and concurrency settings
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("block_size", self.block_size),
            ("chunk_size", self.chunk_size),
            ("max_chunk_size", self.max_chunk_size),
        ] {
            if !value.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "{} must be a power of two, got {}",
                    name, value
                )));
            }
        }

        if self.chunk_size < self.block_size || self.chunk_size > self.max_chunk_size {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} must lie between block_size {} and max_chunk_size {}",
                self.chunk_size, self.block_size, self.max_chunk_size
            )));
        }

        if self.pipeline_depth == 0 {
            return Err(Error::InvalidConfig(
                "Pipeline depth must be greater than 0".to_string(),
            ));
        }

        if self.connections_per_session == 0 {
            return Err(Error::InvalidConfig(
                "Connections per session must be greater than 0".to_string(),
            ));
        }

        if self.max_buffered_chunks == 0 {
            return Err(Error::InvalidConfig(
                "Buffered chunk cap must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
