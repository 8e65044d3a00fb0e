use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantError {
    #[error("tensor {name}: expected {expected} scales, found {actual}")]
    ScaleCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor {name}: expected {expected} zero points, found {actual}")]
    ZeroPointCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor {name}: {actual} quantized values for shape {shape:?}")]
    ValueCount {
        name: String,
        shape: Vec<usize>,
        actual: usize,
    },

    #[error("block size must be positive")]
    InvalidBlockSize,
}

pub type Result<T> = std::result::Result<T, QuantError>;
