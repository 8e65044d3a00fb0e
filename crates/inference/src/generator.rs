use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gemi_core::{CoreError, KvCache};
use tokenizer::{StreamDecoder, TokenizerError};
use tracing::debug;

use crate::context::ConversationContext;
use crate::error::GenerationError;
use crate::model::LoadedModel;
use crate::registry::ModelLease;
use crate::sampling::{Sampler, SamplingPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced an end-of-sequence or end-of-turn token.
    Stop,
    /// `max_new_tokens` were generated.
    Length,
    /// The context window is exhausted.
    ContextFull,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub reason: FinishReason,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// `text` is whatever UTF-8 the token completed; it may be empty.
    Token { id: u32, text: String },
    Done(GenerationSummary),
}

/// Cooperative cancellation, checked before every decode step.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One assistant reply: prompt, private KV cache, sampler and stream decoder.
///
/// Each call to [`GenerationSession::step`] runs at most one forward pass.
pub struct GenerationSession {
    lease: ModelLease,
    prompt: Vec<u32>,
    cache: KvCache,
    sampler: Sampler,
    decoder: StreamDecoder,
    history: Vec<u32>,
    last: Option<u32>,
    generated: usize,
    max_new_tokens: usize,
    cancel: CancelHandle,
    started: Instant,
    finished: bool,
}

impl GenerationSession {
    /// Render `context`, fit it into the window and prepare to decode.
    pub fn new(
        lease: ModelLease,
        context: &ConversationContext,
        policy: SamplingPolicy,
        max_new_tokens: usize,
    ) -> Result<Self, GenerationError> {
        let sampler = Sampler::new(policy)?;
        let prompt = lease.prepare_prompt(context, max_new_tokens)?;
        Ok(Self::from_prompt(lease, prompt, sampler, max_new_tokens))
    }

    /// A session on a model that is not owned by any registry.
    pub fn detached(
        model: Arc<LoadedModel>,
        context: &ConversationContext,
        policy: SamplingPolicy,
        max_new_tokens: usize,
    ) -> Result<Self, GenerationError> {
        Self::new(ModelLease::detached(model), context, policy, max_new_tokens)
    }

    fn from_prompt(lease: ModelLease, prompt: Vec<u32>, sampler: Sampler, max_new_tokens: usize) -> Self {
        let cache = lease.transformer().new_cache();
        debug!(
            prompt_tokens = prompt.len(),
            max_new_tokens,
            greedy = sampler.policy().is_greedy(),
            "session started"
        );
        Self {
            history: prompt.clone(),
            lease,
            prompt,
            cache,
            sampler,
            decoder: StreamDecoder::new(true),
            last: None,
            generated: 0,
            max_new_tokens,
            cancel: CancelHandle::new(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt.len()
    }

    pub fn generated_tokens(&self) -> usize {
        self.generated
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode one token. `None` once the session has reported `Done` or an error.
    pub fn step(&mut self) -> Option<Result<GenerationEvent, GenerationError>> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            return Some(Ok(self.finish(FinishReason::Cancelled)));
        }
        if self.generated >= self.max_new_tokens {
            return Some(Ok(self.finish(FinishReason::Length)));
        }

        let logits = match self.next_logits() {
            Ok(Some(logits)) => logits,
            Ok(None) => return Some(Ok(self.finish(FinishReason::ContextFull))),
            Err(e) => return Some(Err(self.fail(e.into()))),
        };
        let id = match self.sampler.sample(&logits, &self.history) {
            Ok(id) => id,
            Err(e) => return Some(Err(self.fail(e.into()))),
        };
        self.history.push(id);
        self.last = Some(id);

        if self.lease.is_stop(id) {
            return Some(Ok(self.finish(FinishReason::Stop)));
        }
        self.generated += 1;

        let text = match self.decoder.push(self.lease.tokenizer(), id) {
            Ok(text) => text,
            // Model vocabularies are often padded past the tokenizer's ids.
            Err(TokenizerError::UnknownId(_)) => String::new(),
            Err(e) => return Some(Err(self.fail(e.into()))),
        };
        Some(Ok(GenerationEvent::Token { id, text }))
    }

    fn next_logits(&mut self) -> Result<Option<Vec<f32>>, CoreError> {
        let transformer = self.lease.transformer();
        match self.last {
            None => transformer.prefill(&self.prompt, &mut self.cache).map(Some),
            Some(_) if self.cache.remaining() == 0 => Ok(None),
            Some(token) => transformer.forward(token, &mut self.cache).map(Some),
        }
    }

    fn finish(&mut self, reason: FinishReason) -> GenerationEvent {
        self.finished = true;
        if self.decoder.has_pending() {
            debug!(tail = %self.decoder.finish(), "dropping unfinished character");
        }
        self.lease.record_session(true);
        let summary = GenerationSummary {
            reason,
            prompt_tokens: self.prompt.len(),
            generated_tokens: self.generated,
            elapsed: self.started.elapsed(),
        };
        debug!(?summary, "session finished");
        GenerationEvent::Done(summary)
    }

    fn fail(&mut self, error: GenerationError) -> GenerationError {
        self.finished = true;
        if matches!(error, GenerationError::Compute(_) | GenerationError::Sampling(_)) {
            self.lease.record_session(false);
        }
        debug!(%error, generated = self.generated, "session failed");
        error
    }
}

impl Iterator for GenerationSession {
    type Item = Result<GenerationEvent, GenerationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step()
    }
}

impl std::fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("prompt_tokens", &self.prompt.len())
            .field("generated", &self.generated)
            .field("max_new_tokens", &self.max_new_tokens)
            .field("finished", &self.finished)
            .finish()
    }
}
