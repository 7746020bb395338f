//! Configuration system for Courier.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $COURIER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/courier/config.toml
//!   3. ~/.config/courier/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::crypto::{CryptoError, SecretKey};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub transport: TransportConfig,
    pub routing: RoutingConfig,
    pub fragmentation: FragmentationConfig,
    pub encryption: EncryptionConfig,
    pub correlation: CorrelationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
}

/// Wire topic = `{prefix}{route}{suffix}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub prefix: String,
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentationConfig {
    /// Byte budget per fragment. JSON batches serialize strictly below it;
    /// text longer than it is split into chunks of at most this many bytes.
    pub max_message_length: usize,
    /// Largest raw file payload accepted by `send_file`.
    pub max_file_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Client-wide static key, base64. Empty = none.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Pending file transfers and partial text messages older than this are evicted.
    pub ttl_secs: u64,
    /// How often the dispatch loop runs the reaper.
    pub reap_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
        }
    }
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            max_message_length: 40_000,
            max_file_bytes: 256 * 1024 * 1024, // 256 MB, the MQTT payload ceiling
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            reap_interval_secs: 30,
        }
    }
}

impl FragmentationConfig {
    /// Most fragments a single text message may span: the largest payload,
    /// base64-encoded, cut at the budget.
    pub fn max_fragments(&self) -> u32 {
        let encoded = self.max_file_bytes.div_ceil(3).saturating_mul(4);
        let count = encoded.div_ceil(self.max_message_length.max(1)).max(1);
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

impl CorrelationConfig {
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_secs)
    }

    pub fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl EncryptionConfig {
    /// Parse the static key, if one is configured.
    pub fn static_key(&self) -> Result<Option<SecretKey>, ConfigError> {
        if self.key.trim().is_empty() {
            return Ok(None);
        }
        SecretKey::from_base64(&self.key)
            .map(Some)
            .map_err(ConfigError::InvalidKey)
    }
}

impl RoutingConfig {
    /// Expand a route name into its wire topic.
    pub fn topic(&self, route: &str) -> String {
        format!("{}{}{}", self.prefix, route, self.suffix)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("courier")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid encryption key: {0}")]
    InvalidKey(CryptoError),
    #[error("invalid setting: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CourierConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            CourierConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a specific TOML file without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("COURIER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CourierConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the codec cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fragmentation.max_message_length == 0 {
            return Err(ConfigError::Invalid(
                "fragmentation.max_message_length must be non-zero",
            ));
        }
        self.encryption.static_key()?;
        Ok(())
    }

    /// Apply COURIER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("COURIER_TRANSPORT__HOST") {
            self.transport.host = v;
        }
        if let Some(v) = lookup("COURIER_TRANSPORT__PORT") {
            if let Ok(p) = v.parse() {
                self.transport.port = p;
            }
        }
        if let Some(v) = lookup("COURIER_ROUTING__PREFIX") {
            self.routing.prefix = v;
        }
        if let Some(v) = lookup("COURIER_ROUTING__SUFFIX") {
            self.routing.suffix = v;
        }
        if let Some(v) = lookup("COURIER_FRAGMENTATION__MAX_MESSAGE_LENGTH") {
            if let Ok(n) = v.parse() {
                self.fragmentation.max_message_length = n;
            }
        }
        if let Some(v) = lookup("COURIER_FRAGMENTATION__MAX_FILE_BYTES") {
            if let Ok(n) = v.parse() {
                self.fragmentation.max_file_bytes = n;
            }
        }
        if let Some(v) = lookup("COURIER_ENCRYPTION__KEY") {
            self.encryption.key = v;
        }
        if let Some(v) = lookup("COURIER_CORRELATION__TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.correlation.ttl_secs = n;
            }
        }
        if let Some(v) = lookup("COURIER_CORRELATION__REAP_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.correlation.reap_interval_secs = n;
            }
        }
    }
}
