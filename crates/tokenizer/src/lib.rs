//! Byte-pair tokenizer for chat models: merges, special tokens, byte
//! fallback and incremental decoding for streamed generation.

pub mod bpe;
pub mod error;
mod hf;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tokenizer;
pub mod vocab;

pub use bpe::Merges;
pub use error::{Result, TokenizerError};
pub use stream::StreamDecoder;
pub use tokenizer::{Tokenizer, TokenizerFile, SPACE_MARKER};
pub use vocab::Vocab;
