//! Model configuration, weight resolution and the transformer forward pass.
//!
//! Everything here is synchronous and allocation-light: weights are resolved
//! once into `f32` buffers, and each decode step runs on plain slices with
//! row-parallel matrix-vector products.

pub mod attention;
pub mod config;
pub mod error;
pub mod kv_cache;
pub mod layer_norm;
pub mod linear;
pub mod rotary;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transformer;
pub mod weights;

pub use config::{Activation, ConfigError, ConfigViolation, Family, ModelConfig, Problem};
pub use error::{CoreError, Result, ShapeMismatch};
pub use kv_cache::KvCache;
pub use transformer::Transformer;
pub use weights::{WeightHandle, WeightStore};
