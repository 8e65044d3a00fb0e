//! Chat inference on top of `gemi_core`: model loading and lifecycle,
//! prompt assembly, sampling and streamed generation.

pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod model;
pub mod registry;
pub mod sampling;
pub mod service;

pub use config::EngineConfig;
pub use context::{ChatTemplate, ConversationContext, Role, Turn};
pub use error::{EngineConfigError, GenerationError, LoadError};
pub use generator::{CancelHandle, FinishReason, GenerationEvent, GenerationSession, GenerationSummary};
pub use model::{load_model, LoadOptions, LoadedModel};
pub use registry::{
    DirectoryLoader, HealthReport, LoadState, LoadStatus, ModelLease, ModelLoader, ModelRegistry,
    UnloadOutcome,
};
pub use sampling::{Sampler, SamplingError, SamplingPolicy};
pub use service::{GenerationService, GenerationStream};
