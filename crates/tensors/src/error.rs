use thiserror::Error;

use crate::dtype::Dtype;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The header could not be decoded or violates the layout rules.
    #[error("format error: {0}")]
    Format(String),

    #[error("tensor {name} spans bytes {start}..{end}, payload has {payload_len}")]
    Range {
        name: String,
        start: usize,
        end: usize,
        payload_len: usize,
    },

    #[error("tensor not found: {0}")]
    NotFound(String),

    #[error("tensor {name} has dtype {dtype} which cannot be read as f32")]
    UnsupportedConversion { name: String, dtype: Dtype },
}

impl ContainerError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;
