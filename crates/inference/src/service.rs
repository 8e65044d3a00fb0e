//! Async front of the engine: loading with progress, health, and streamed
//! generation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::EngineConfig;
use crate::context::ConversationContext;
use crate::error::{GenerationError, LoadError};
use crate::generator::{CancelHandle, GenerationEvent, GenerationSession};
use crate::model::LoadOptions;
use crate::registry::{
    DirectoryLoader, HealthReport, LoadState, LoadStatus, ModelLease, ModelRegistry, UnloadOutcome,
};
use crate::sampling::SamplingPolicy;

type StepOutput = (GenerationSession, Option<Result<GenerationEvent, GenerationError>>);

/// Lazily decoded reply. Every poll runs one decode step on a blocking
/// worker; dropping the stream cancels the session.
pub struct GenerationStream {
    session: Option<GenerationSession>,
    pending: Option<JoinHandle<StepOutput>>,
    cancel: CancelHandle,
}

impl GenerationStream {
    pub fn new(session: GenerationSession) -> Self {
        Self {
            cancel: session.cancel_handle(),
            session: Some(session),
            pending: None,
        }
    }

    /// Takes effect before the next decode step; the stream then yields
    /// `Done` with [`FinishReason::Cancelled`](crate::FinishReason::Cancelled).
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Stream for GenerationStream {
    type Item = Result<GenerationEvent, GenerationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.pending.is_none() {
            let Some(mut session) = this.session.take() else {
                return Poll::Ready(None);
            };
            this.pending = Some(tokio::task::spawn_blocking(move || {
                let item = session.step();
                (session, item)
            }));
        }
        let Some(handle) = this.pending.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(joined) => {
                this.pending = None;
                match joined {
                    Ok((session, item)) => {
                        if !session.is_finished() {
                            this.session = Some(session);
                        }
                        Poll::Ready(item)
                    }
                    Err(e) => Poll::Ready(Some(Err(GenerationError::Worker(e.to_string())))),
                }
            }
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("session", &self.session)
            .field("in_flight", &self.pending.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GenerationService {
    registry: ModelRegistry,
    max_new_tokens: usize,
    default_policy: SamplingPolicy,
}

impl GenerationService {
    pub fn new(registry: ModelRegistry) -> Self {
        let defaults = EngineConfig::default();
        Self {
            registry,
            max_new_tokens: defaults.max_new_tokens,
            default_policy: defaults.sampling,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let loader = DirectoryLoader::new(&config.model_dir)
            .with_options(LoadOptions {
                quantization: config.quantization,
            })
            .with_warmup(config.warmup);
        let registry = ModelRegistry::with_threshold(Arc::new(loader), config.unhealthy_after);
        Self {
            registry,
            max_new_tokens: config.max_new_tokens,
            default_policy: config.sampling.clone(),
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_default_policy(mut self, policy: SamplingPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn default_policy(&self) -> &SamplingPolicy {
        &self.default_policy
    }

    /// Start (or join) a load and follow it.
    ///
    /// Yields each progress update and ends with the `Ready` status or the
    /// load error.
    pub fn load_model(&self) -> BoxStream<'static, Result<LoadStatus, Arc<LoadError>>> {
        let registry = self.registry.clone();
        let updates = registry.progress_stream();
        let done: BoxFuture<'static, Result<ModelLease, Arc<LoadError>>> = {
            let registry = registry.clone();
            async move { registry.ensure_loaded().await }.boxed()
        };

        stream::unfold(Some((registry, updates, done)), |state| async move {
            let Some((registry, mut updates, mut done)) = state else {
                return None;
            };
            loop {
                tokio::select! {
                    biased;
                    result = &mut done => {
                        let item = result.map(|lease| {
                            drop(lease);
                            registry.status()
                        });
                        return Some((item, None));
                    }
                    Some(status) = updates.next() => {
                        // The outcome, Ready or failed, comes from the load itself.
                        if status.state != LoadState::Loading {
                            continue;
                        }
                        return Some((Ok(status), Some((registry, updates, done))));
                    }
                }
            }
        })
        .boxed()
    }

    pub fn health(&self) -> HealthReport {
        self.registry.health()
    }

    pub fn unload(&self) -> UnloadOutcome {
        self.registry.unload()
    }

    pub async fn reload(&self) -> Result<(), Arc<LoadError>> {
        self.registry.reload().await.map(drop)
    }

    /// Load if needed, then prepare a reply to `context`.
    ///
    /// `policy` falls back to the configured default. No token is decoded
    /// until the returned stream is polled.
    pub async fn generate(
        &self,
        context: ConversationContext,
        policy: Option<SamplingPolicy>,
    ) -> Result<GenerationStream, GenerationError> {
        let lease = self.registry.ensure_loaded().await?;
        let policy = policy.unwrap_or_else(|| self.default_policy.clone());
        let max_new_tokens = self.max_new_tokens;
        let session = tokio::task::spawn_blocking(move || {
            GenerationSession::new(lease, &context, policy, max_new_tokens)
        })
        .await
        .map_err(|e| GenerationError::Worker(e.to_string()))??;
        debug!(prompt_tokens = session.prompt_tokens(), "generation ready");
        Ok(GenerationStream::new(session))
    }
}
