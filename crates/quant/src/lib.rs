//! Dequantization strategies for integer-quantized weights.
//!
//! Quantized tensors are stored as I8/U8 elements next to a companion scale
//! tensor. How scales map onto elements is a [`Dequantizer`]; the concrete
//! strategy is chosen by [`QuantScheme`] from the model configuration.

pub mod blockwise;
pub mod error;
pub mod per_channel;
pub mod scheme;

pub use blockwise::Blockwise;
pub use error::{QuantError, Result};
pub use per_channel::{quantize_per_channel, PerChannel};
pub use scheme::{Dequantizer, QuantScheme, QuantizedTensor};
