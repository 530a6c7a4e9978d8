//! Client configuration file (`config.toml`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 8;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("dashfm");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("dashfm");
    }
    PathBuf::from(".dashfm")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Dashboard base URL, e.g. `https://dash.example.com`
    pub dashboard: Option<String>,
    /// Where downloads are saved
    pub download_dir: PathBuf,
    /// Downloads larger than this fail instead of exhausting memory
    pub max_download_bytes: u64,
    /// Append session events to this file
    pub log_file: Option<PathBuf>,
    /// Frames allowed in flight towards the socket
    pub outbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dashboard: None,
            download_dir: PathBuf::from("."),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            log_file: None,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text)?;
        if cfg.outbound_queue == 0 {
            anyhow::bail!("outbound_queue must be at least 1");
        }
        Ok(cfg)
    }
}
