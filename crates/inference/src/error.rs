use std::sync::Arc;

use gemi_core::{ConfigError, CoreError};
use thiserror::Error;
use tokenizer::TokenizerError;

use crate::sampling::SamplingError;

/// Why a model could not be made resident.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("model error: {0}")]
    Core(#[from] CoreError),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("tokenizer has {tokenizer} ids but the model vocabulary is {model}")]
    VocabMismatch { tokenizer: usize, model: usize },

    #[error("warm-up generation failed: {0}")]
    Warmup(#[source] Box<GenerationError>),

    #[error("model was unloaded before loading finished")]
    Unloaded,

    #[error("model is unhealthy after {failures} consecutive failed sessions, reload required")]
    Unhealthy { failures: u32 },

    #[error("load worker failed: {0}")]
    Worker(String),
}

impl From<tensors::ContainerError> for LoadError {
    fn from(e: tensors::ContainerError) -> Self {
        LoadError::Core(CoreError::Container(e))
    }
}

impl From<quant::QuantError> for LoadError {
    fn from(e: quant::QuantError) -> Self {
        LoadError::Core(CoreError::Quant(e))
    }
}

#[derive(Error, Debug)]
pub enum GenerationError {
    /// Shared with every caller that waited on the same load.
    #[error("model load failed: {0}")]
    Load(Arc<LoadError>),

    #[error("tokenizer error: {0}")]
    Tokenize(#[from] TokenizerError),

    #[error("compute error: {0}")]
    Compute(#[from] CoreError),

    #[error("sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("conversation renders to an empty prompt")]
    EmptyPrompt,

    #[error("generation worker failed: {0}")]
    Worker(String),
}

impl From<Arc<LoadError>> for GenerationError {
    fn from(e: Arc<LoadError>) -> Self {
        GenerationError::Load(e)
    }
}

#[derive(Error, Debug)]
pub enum EngineConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
