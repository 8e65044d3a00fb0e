use std::fs;
use std::path::{Path, PathBuf};

use quant::QuantScheme;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineConfigError;
use crate::registry::DEFAULT_UNHEALTHY_AFTER;
use crate::sampling::SamplingPolicy;

/// Engine settings, usually read from a YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model_dir: PathBuf,
    pub max_new_tokens: usize,
    pub sampling: SamplingPolicy,
    /// Consecutive failed sessions before the model is marked unhealthy.
    pub unhealthy_after: u32,
    pub warmup: bool,
    /// Overrides the scheme in the model's `config.json`.
    pub quantization: Option<QuantScheme>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models/gemi"),
            max_new_tokens: 2048,
            sampling: SamplingPolicy::default(),
            unhealthy_after: DEFAULT_UNHEALTHY_AFTER,
            warmup: true,
            quantization: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, EngineConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineConfigError> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    /// The file at `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, EngineConfigError> {
        let path = path.as_ref();
        if path.exists() {
            info!(path = %path.display(), "reading engine config");
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_yaml(&self) -> Result<String, EngineConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
