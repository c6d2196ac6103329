//! Configuration system for snapdump.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SNAPDUMP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/snapdump/config.toml
//!   3. ~/.config/snapdump/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapdumpConfig {
    pub transfer: TransferConfig,
    pub throttle: ThrottleConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per read. 0 = object size × stripe count of the image.
    pub chunk_size: u64,
    /// Chunks buffered between reader and writer.
    pub queue_depth: usize,
    /// Sync the output every N chunks.
    pub flush_every: u32,
    /// Run reader and writer concurrently. False = one sequential loop.
    pub pipelined: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Read budget in bytes/sec. 0 = unlimited.
    pub bytes_per_sec: u64,
    /// Bucket capacity in bytes. 0 = one second of `bytes_per_sec`.
    pub burst_bytes: u64,
    /// Wait between attempts when the bucket is short.
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Delete a destination file we created if the transfer fails.
    pub remove_on_failure: bool,
    /// Render a progress line on stdout.
    pub progress: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            queue_depth: 6,
            flush_every: 10,
            pipelined: true,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bytes_per_sec: 0,
            burst_bytes: 0,
            backoff_ms: 1000,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            remove_on_failure: true,
            progress: true,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("snapdump")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SnapdumpConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            SnapdumpConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SNAPDUMP_CONFIG")
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
            let text = toml::to_string_pretty(&SnapdumpConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SNAPDUMP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("SNAPDUMP_TRANSFER__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.transfer.chunk_size = v;
        }
        if let Some(v) = lookup("SNAPDUMP_TRANSFER__QUEUE_DEPTH").and_then(|v| v.parse().ok()) {
            self.transfer.queue_depth = v;
        }
        if let Some(v) = lookup("SNAPDUMP_TRANSFER__FLUSH_EVERY").and_then(|v| v.parse().ok()) {
            self.transfer.flush_every = v;
        }
        if let Some(v) = lookup("SNAPDUMP_TRANSFER__PIPELINED") {
            self.transfer.pipelined = flag(v);
        }
        if let Some(v) = lookup("SNAPDUMP_THROTTLE__BYTES_PER_SEC").and_then(|v| v.parse().ok()) {
            self.throttle.bytes_per_sec = v;
        }
        if let Some(v) = lookup("SNAPDUMP_THROTTLE__BURST_BYTES").and_then(|v| v.parse().ok()) {
            self.throttle.burst_bytes = v;
        }
        if let Some(v) = lookup("SNAPDUMP_THROTTLE__BACKOFF_MS").and_then(|v| v.parse().ok()) {
            self.throttle.backoff_ms = v;
        }
        if let Some(v) = lookup("SNAPDUMP_OUTPUT__REMOVE_ON_FAILURE") {
            self.output.remove_on_failure = flag(v);
        }
        if let Some(v) = lookup("SNAPDUMP_OUTPUT__PROGRESS") {
            self.output.progress = flag(v);
        }
    }
}
