use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::queue::ShutdownPolicy;

const DEFAULT_MAX_PENDING_JOBS: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("lane names must be distinct and non-empty")]
    LaneNames,
}

/// Names of the three lanes. They become the worker thread names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LaneNames {
    pub scripting: String,
    pub native_modules: String,
    pub rendering: String,
}

impl Default for LaneNames {
    fn default() -> Self {
        Self {
            scripting: "js".to_string(),
            native_modules: "native_modules".to_string(),
            rendering: "rendering".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuickJsConfig {
    /// Upper bound on promise jobs drained after a single evaluation.
    pub max_pending_jobs: usize,
}

impl Default for QuickJsConfig {
    fn default() -> Self {
        Self {
            max_pending_jobs: DEFAULT_MAX_PENDING_JOBS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub lanes: LaneNames,
    pub shutdown: ShutdownPolicy,
    /// Ship every call issued within one scripting-lane turn in a single envelope.
    pub coalesce_calls: bool,
    pub quickjs: QuickJsConfig,
}

impl BridgeConfig {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let LaneNames {
            scripting,
            native_modules,
            rendering,
        } = &self.lanes;
        let names = [scripting, native_modules, rendering];
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::LaneNames);
        }
        if scripting == native_modules || scripting == rendering || native_modules == rendering {
            return Err(ConfigError::LaneNames);
        }
        Ok(())
    }
}
