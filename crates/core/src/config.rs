use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_FILE_NAME: &str = "blobshift.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_shard_size_bytes")]
    pub shard_size_bytes: u64,
    #[serde(default = "default_space_name_prefix")]
    pub space_name_prefix: String,
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    4
}

fn default_shard_size_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_space_name_prefix() -> String {
    "migration".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            shard_size_bytes: default_shard_size_bytes(),
            space_name_prefix: default_space_name_prefix(),
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts < 1 {
            return Err(Error::InvalidConfig {
                message: "retry.max_attempts must be >= 1".to_string(),
            });
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::InvalidConfig {
                message: "retry backoff must satisfy base_backoff_ms <= max_backoff_ms".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig {
                message: "batch_size must be > 0".to_string(),
            });
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig {
                message: "concurrency must be > 0".to_string(),
            });
        }
        if self.shard_size_bytes == 0 {
            return Err(Error::InvalidConfig {
                message: "shard_size_bytes must be > 0".to_string(),
            });
        }
        if self.space_name_prefix.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "space_name_prefix must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceSettings {
    Fs { root: PathBuf },
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationSettings {
    Fs {
        root: PathBuf,
        #[serde(default)]
        space: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub migration: MigrationConfig,
    pub source: SourceSettings,
    pub destination: DestinationSettings,
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::InvalidConfig {
            message: format!("settings file not found: {}", path.display()),
        });
    }

    let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
        message: format!("settings read failed: {e}"),
    })?;

    parse_settings(&text)
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(text).map_err(|e| Error::InvalidConfig {
        message: format!("settings invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    settings.migration.validate()?;

    match &settings.source {
        SourceSettings::Fs { root } if root.as_os_str().is_empty() => {
            return Err(Error::InvalidConfig {
                message: "source.root must not be empty".to_string(),
            });
        }
        SourceSettings::Sqlite { path } if path.as_os_str().is_empty() => {
            return Err(Error::InvalidConfig {
                message: "source.path must not be empty".to_string(),
            });
        }
        _ => {}
    }

    let DestinationSettings::Fs { root, space } = &settings.destination;
    if root.as_os_str().is_empty() {
        return Err(Error::InvalidConfig {
            message: "destination.root must not be empty".to_string(),
        });
    }
    if let Some(space) = space
        && space.trim().is_empty()
    {
        return Err(Error::InvalidConfig {
            message: "destination.space must not be empty when set".to_string(),
        });
    }

    Ok(())
}
