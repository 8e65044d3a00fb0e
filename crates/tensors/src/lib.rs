//! Reader for the header-prefixed tensor container format (safetensors layout).
//!
//! A container is an 8-byte little-endian header length, a JSON header mapping
//! tensor names to `{dtype, shape, data_offsets}`, then the raw payload.
//! Tensor bytes are handed out as borrowed slices of the (usually memory-mapped)
//! file, nothing is copied until a caller converts them.

pub mod container;
pub mod dtype;
pub mod error;
pub mod set;
pub mod writer;

pub use container::{parse_header, Container, Header, TensorDescriptor, TensorSource};
pub use dtype::Dtype;
pub use error::{ContainerError, Result};
pub use set::ContainerSet;
pub use writer::ContainerWriter;
