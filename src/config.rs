//! Runtime configuration.
//!
//! Each setting resolves in priority order: command-line flag or environment
//! variable, then the TOML file passed with `--config`, then a built-in default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_DATABASE: &str = "beatmarket.db";
pub const DEFAULT_BLOB_ROOT: &str = "blobs";
pub const DEFAULT_PUBLIC_URL: &str = "file://blobs";

/// Settings as they appear in the TOML file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub database: Option<String>,
    pub blob_root: Option<PathBuf>,
    pub public_url: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database: String,
    pub blob_root: PathBuf,
    pub public_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            blob_root: PathBuf::from(DEFAULT_BLOB_ROOT),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
        }
    }
}

/// Values given on the command line (or through their environment variables).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database: Option<String>,
    pub blob_root: Option<PathBuf>,
    pub public_url: Option<String>,
}

impl AppConfig {
    pub fn resolve(overrides: Overrides, file: Option<FileConfig>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        Self {
            database: overrides
                .database
                .or(file.database)
                .unwrap_or(defaults.database),
            blob_root: overrides
                .blob_root
                .or(file.blob_root)
                .unwrap_or(defaults.blob_root),
            public_url: overrides
                .public_url
                .or(file.public_url)
                .unwrap_or(defaults.public_url),
        }
    }

    /// Resolve, reading the TOML file when a path is given.
    pub fn load(overrides: Overrides, config_path: Option<&Path>) -> Result<Self> {
        let file = config_path.map(FileConfig::load).transpose()?;
        Ok(Self::resolve(overrides, file))
    }
}
