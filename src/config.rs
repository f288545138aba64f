//! Configuration file parser for ~/.config/feedsync/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::api::ClientOptions;
use crate::model::Author;
use crate::network::ProbeConfig;
use crate::prefetch::PrefetchConfig;
use crate::queue::RetryPolicy;
use crate::realtime::StreamConfig;
use crate::storage::StoreLimits;
use crate::sync::SyncConfig;

/// Environment variable that overrides `api_token` from the file.
pub const TOKEN_ENV_VAR: &str = "FEEDSYNC_API_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// Every field is defaulted, so any subset of keys can be specified. The
/// API token is redacted in `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL. Required by every command that talks to the server.
    pub api_base_url: Option<String>,

    /// Bearer token. `FEEDSYNC_API_TOKEN` takes precedence.
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_token: Option<SecretString>,

    pub page_size: u32,
    pub max_cached_items: usize,
    /// Total media cache budget
    pub max_media_bytes: u64,
    /// Largest single media download
    pub max_media_bytes_per_item: usize,

    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub fast_probe_threshold_ms: u64,

    pub queue_max_attempts: u32,
    pub queue_backoff_base_ms: u64,
    pub drain_interval_secs: u64,

    pub stream_backoff_max_secs: u64,

    pub lookahead_fast: usize,
    pub lookahead_slow: usize,
    pub prefetch_concurrency: usize,

    /// Allow loopback and private-range hosts for the API and media.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_token: None,
            page_size: 15,
            max_cached_items: 500,
            max_media_bytes: 64 * 1024 * 1024,
            max_media_bytes_per_item: 8 * 1024 * 1024,
            probe_interval_secs: 30,
            probe_timeout_ms: 5000,
            fast_probe_threshold_ms: 400,
            queue_max_attempts: 3,
            queue_backoff_base_ms: 2000,
            drain_interval_secs: 30,
            stream_backoff_max_secs: 30,
            lookahead_fast: 8,
            lookahead_slow: 2,
            prefetch_concurrency: 3,
            allow_private_hosts: false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("page_size", &self.page_size)
            .field("max_cached_items", &self.max_cached_items)
            .field("max_media_bytes", &self.max_media_bytes)
            .field("max_media_bytes_per_item", &self.max_media_bytes_per_item)
            .field("probe_interval_secs", &self.probe_interval_secs)
            .field("probe_timeout_ms", &self.probe_timeout_ms)
            .field("fast_probe_threshold_ms", &self.fast_probe_threshold_ms)
            .field("queue_max_attempts", &self.queue_max_attempts)
            .field("queue_backoff_base_ms", &self.queue_backoff_base_ms)
            .field("drain_interval_secs", &self.drain_interval_secs)
            .field("stream_backoff_max_secs", &self.stream_backoff_max_secs)
            .field("lookahead_fast", &self.lookahead_fast)
            .field("lookahead_slow", &self.lookahead_slow)
            .field("prefetch_concurrency", &self.prefetch_concurrency)
            .field("allow_private_hosts", &self.allow_private_hosts)
            .finish()
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

const KNOWN_KEYS: &[&str] = &[
    "api_base_url",
    "api_token",
    "page_size",
    "max_cached_items",
    "max_media_bytes",
    "max_media_bytes_per_item",
    "probe_interval_secs",
    "probe_timeout_ms",
    "fast_probe_threshold_ms",
    "queue_max_attempts",
    "queue_backoff_base_ms",
    "drain_interval_secs",
    "stream_backoff_max_secs",
    "lookahead_fast",
    "lookahead_slow",
    "prefetch_concurrency",
    "allow_private_hosts",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    ///
    /// Environment overrides are not applied here; see
    /// [`Config::with_env_overrides`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            page_size = config.page_size,
            max_cached_items = config.max_cached_items,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply `FEEDSYNC_API_TOKEN` on top of the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_token_override(std::env::var(TOKEN_ENV_VAR).ok())
    }

    fn with_token_override(mut self, token: Option<String>) -> Self {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.api_token = Some(SecretString::from(token));
        }
        self
    }

    // ========================================================================
    // Component settings
    // ========================================================================

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_items: self.max_cached_items,
            max_media_bytes: self.max_media_bytes,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            max_media_bytes: self.max_media_bytes_per_item,
            allow_private_hosts: self.allow_private_hosts,
            ..ClientOptions::default()
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_secs(self.probe_interval_secs.max(1)),
            timeout: Duration::from_millis(self.probe_timeout_ms),
            fast_threshold: Duration::from_millis(self.fast_probe_threshold_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.queue_max_attempts.max(1),
            backoff_base: Duration::from_millis(self.queue_backoff_base_ms),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            max_backoff: Duration::from_secs(self.stream_backoff_max_secs.max(1)),
            ..StreamConfig::default()
        }
    }

    pub fn prefetch_config(&self) -> PrefetchConfig {
        PrefetchConfig {
            lookahead_fast: self.lookahead_fast,
            lookahead_slow: self.lookahead_slow,
            concurrency: self.prefetch_concurrency.max(1),
            allow_private_hosts: self.allow_private_hosts,
            ..PrefetchConfig::default()
        }
    }

    pub fn sync_config(&self, viewer: Author) -> SyncConfig {
        SyncConfig {
            page_size: self.page_size.max(1),
            drain_interval: Duration::from_secs(self.drain_interval_secs.max(1)),
            retry: self.retry_policy(),
            prefetch: self.prefetch_config(),
            viewer,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
