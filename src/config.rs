use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::build::options::BuildOptions;
use crate::error::{PackwireError, Result};
use crate::protocol::codec::DEFAULT_MAX_FRAME_LENGTH;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub worker: WorkerConfig,
    pub serve: ServeConfig,
    /// Base options merged under command-line arguments.
    pub build: BuildOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    pub expected_version: String,
    pub working_dir: Option<PathBuf>,
    pub max_frame_bytes: usize,
    /// No timeout when unset; the protocol itself defines none.
    pub request_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("packwire-worker"),
            args: Vec::new(),
            expected_version: env!("CARGO_PKG_VERSION").to_string(),
            working_dir: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_LENGTH,
            request_timeout_ms: None,
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub host: Option<String>,
    pub port: u16,
    pub servedir: Option<PathBuf>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 8000,
            servedir: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config = Self::from_yaml(&content).map_err(|e| match e {
            PackwireError::InvalidOption(msg) => {
                PackwireError::InvalidOption(format!("{}: {}", path.as_ref().display(), msg))
            }
            other => other,
        })?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| PackwireError::InvalidOption(e.to_string()))
    }
}
