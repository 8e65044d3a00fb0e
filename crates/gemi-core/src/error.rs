use std::fmt;

use tensors::{ContainerError, Dtype};
use thiserror::Error;

use crate::config::ConfigError;

/// A weight present under the expected name but with the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} expected {:?}, found {:?}", self.name, self.expected, self.actual)
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    #[error("dequantization error: {0}")]
    Quant(#[from] quant::QuantError),

    #[error("missing weights: {}", .0.join(", "))]
    MissingWeights(Vec<String>),

    #[error("shape mismatch: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    ShapeMismatch(Vec<ShapeMismatch>),

    #[error("weight {name} has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    /// A hidden state or logit became NaN or infinite.
    #[error("non-finite value in {} at position {position}", layer_label(.layer))]
    Compute { layer: Option<usize>, position: usize },

    #[error("token id {id} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange { id: u32, vocab_size: usize },

    #[error("context window of {max} positions is full")]
    ContextOverflow { max: usize },

    #[error("KV cache was invalidated by an earlier compute error")]
    InvalidCache,

    #[error("empty token sequence")]
    EmptyInput,
}

fn layer_label(layer: &Option<usize>) -> String {
    match layer {
        Some(i) => format!("layer {i}"),
        None => "output head".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
