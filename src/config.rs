//! Transfer configuration and safety limits.
//!
//! Defaults match the command-line defaults. A config file (JSON) may set
//! any subset of fields; flags given on the command line override it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_SCALE: f64 = 0.7;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 4096;
pub const DEFAULT_MAX_FRAMES: u32 = 10_000;
pub const DEFAULT_MAX_BONES: u32 = 1000;

/// Per-job resource limits enforced by the [`ResourceMonitor`](crate::monitor::ResourceMonitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Wall-clock budget for one engine run
    pub timeout: Duration,
    /// Resident memory cap for the engine process, in MB
    pub max_memory_mb: u64,
}

impl Limits {
    pub fn new(timeout: Duration, max_memory_mb: u64) -> Self {
        Self { timeout, max_memory_mb }
    }

    /// Memory cap in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
        }
    }
}

/// Settings shared by every job of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Uniform factor applied to bone translations
    pub scale: f64,
    pub timeout_secs: u64,
    pub max_memory_mb: u64,
    pub max_frames: u32,
    pub max_bones: u32,
    /// Engine executable; `None` resolves `blender` via PATH
    pub blender: Option<PathBuf>,
    pub continue_on_error: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_frames: DEFAULT_MAX_FRAMES,
            max_bones: DEFAULT_MAX_BONES,
            blender: None,
            continue_on_error: false,
        }
    }
}

impl TransferConfig {
    /// Load a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::Io(e),
        })?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn limits(&self) -> Limits {
        Limits::new(Duration::from_secs(self.timeout_secs), self.max_memory_mb)
    }

    /// Reject values the engine script cannot represent or that make no sense.
    ///
    /// A scale of exactly zero is accepted: it collapses translations to the
    /// origin, which is a legitimate (if odd) request.
    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() {
            return Err(Error::config(format!("scale must be finite, got {}", self.scale)));
        }
        if self.scale < 0.0 {
            return Err(Error::config(format!("scale must not be negative, got {}", self.scale)));
        }
        if self.timeout_secs == 0 {
            return Err(Error::config("timeout must be at least 1 second"));
        }
        if self.max_memory_mb == 0 {
            return Err(Error::config("max-memory must be at least 1 MB"));
        }
        if self.max_frames == 0 {
            return Err(Error::config("max-frames must be at least 1"));
        }
        if self.max_bones == 0 {
            return Err(Error::config("max-bones must be at least 1"));
        }
        Ok(())
    }
}
