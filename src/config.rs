use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::registers::RegisterMap;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid register map: {0}")]
    RegisterMap(#[from] serde_json::Error),
}

/// Settings for one logger installation, loaded once at startup
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub acquisition: AcquisitionConfig,
    pub backup: BackupConfig,
    pub cloud: CloudConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub retries: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS0".to_string(),
            baud_rate: 9600,
            unit_id: 1,
            timeout_ms: 2000,
            retries: 1,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub register_map: PathBuf,
    pub probe_address: u16,
    pub probe_count: u16,
    pub read_delay_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            register_map: PathBuf::from("~/pysensor/registermap.json"),
            probe_address: 0,
            probe_count: 2,
            read_delay_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub keep_files: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/pysensor/backup"),
            keep_files: 31,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub folder_id: String,
    pub service_account_file: PathBuf,
    pub keep_tables: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            folder_id: String::new(),
            service_account_file: PathBuf::from("~/pysensor/.pysensor-service-creds.json"),
            keep_tables: 31,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/pysensor/log"),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read(path)?;
        let mut config = Self::parse(&text)?;
        config.expand_paths();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn expand_paths(&mut self) {
        self.acquisition.register_map = expand_home(&self.acquisition.register_map);
        self.backup.dir = expand_home(&self.backup.dir);
        self.cloud.service_account_file = expand_home(&self.cloud.service_account_file);
        self.log.dir = expand_home(&self.log.dir);
    }

    /// Reads the register map fresh; called once per cycle
    pub fn load_register_map(&self) -> Result<RegisterMap, ConfigError> {
        let text = read(&self.acquisition.register_map)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Expands a leading `~/` against the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
