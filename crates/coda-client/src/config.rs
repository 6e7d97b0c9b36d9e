//! Session configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CODA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/coda/config.toml
//!   3. ~/.config/coda/config.toml

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything the engine needs to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Account login name sent in the client hello. The server may hand
    /// back a canonicalized form during the handshake.
    pub username: String,

    /// 4-byte identifier of this client implementation.
    pub client_id: u32,

    /// Client build number, checked server-side against the upgrade floor.
    pub client_revision: u32,

    /// 20-byte cache digest announced after login, hex-encoded.
    /// Empty = all zeroes (no local cache).
    pub cache_hash: String,

    /// Depth of the inbound dispatch queue between the receive loop and
    /// the listener consumers.
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            client_id: 0x0100_0200,
            client_revision: 99_999,
            cache_hash: String::new(),
            queue_depth: 16,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SessionConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SessionConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CODA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply CODA_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CODA_USERNAME") {
            self.username = v;
        }
        if let Ok(v) = std::env::var("CODA_CLIENT_REVISION") {
            if let Ok(revision) = v.parse() {
                self.client_revision = revision;
            }
        }
        if let Ok(v) = std::env::var("CODA_QUEUE_DEPTH") {
            if let Ok(depth) = v.parse() {
                self.queue_depth = depth;
            }
        }
    }

    /// Decode the configured cache digest into its wire form.
    pub fn cache_hash_bytes(&self) -> Result<[u8; 20], ConfigError> {
        if self.cache_hash.is_empty() {
            return Ok([0u8; 20]);
        }
        let decoded = hex::decode(&self.cache_hash)
            .map_err(|_| ConfigError::BadCacheHash(self.cache_hash.clone()))?;
        decoded
            .try_into()
            .map_err(|_| ConfigError::BadCacheHash(self.cache_hash.clone()))
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("coda")
}

fn home_or_tmp() -> PathBuf {
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
    #[error("cache_hash is not 20 hex bytes: {0:?}")]
    BadCacheHash(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
