use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("token id {0} is assigned to more than one token")]
    DuplicateId(u32),

    #[error("merge rule {0:?} is not two space-separated tokens")]
    InvalidMerge(String),

    /// A configured special token is absent from the vocabulary.
    #[error("special token not in vocabulary: {0}")]
    UnknownSpecialToken(String),

    #[error("unsupported tokenizer model type: {0}")]
    UnsupportedModel(String),

    #[error("token id not in vocabulary: {0}")]
    UnknownId(u32),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;
