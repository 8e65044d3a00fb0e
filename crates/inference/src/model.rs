use std::fs;
use std::path::Path;

use gemi_core::{ModelConfig, Transformer};
use quant::QuantScheme;
use tensors::ContainerSet;
use tokenizer::Tokenizer;
use tracing::{info, warn};

use crate::context::{ChatTemplate, ConversationContext};
use crate::error::{GenerationError, LoadError};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Knobs for reading a model directory.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Replaces the scheme named in `config.json`.
    pub quantization: Option<QuantScheme>,
}

/// A resident model: transformer, tokenizer and prompt template.
#[derive(Debug)]
pub struct LoadedModel {
    transformer: Transformer,
    tokenizer: Tokenizer,
    template: ChatTemplate,
    stop_ids: Vec<u32>,
}

impl LoadedModel {
    pub fn new(transformer: Transformer, tokenizer: Tokenizer) -> Result<Self, LoadError> {
        let model = transformer.vocab_size();
        if tokenizer.vocab_size() > model {
            return Err(LoadError::VocabMismatch {
                tokenizer: tokenizer.vocab_size(),
                model,
            });
        }
        let mut stop_ids = transformer.config().eos_token_ids.clone();
        for id in tokenizer.stop_ids() {
            if !stop_ids.contains(&id) {
                stop_ids.push(id);
            }
        }
        let template = ChatTemplate::for_family(transformer.config().family());
        Ok(Self {
            transformer,
            tokenizer,
            template,
            stop_ids,
        })
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn config(&self) -> &ModelConfig {
        self.transformer.config()
    }

    pub fn template(&self) -> ChatTemplate {
        self.template
    }

    /// Tokens that end the assistant's turn.
    pub fn stop_ids(&self) -> &[u32] {
        &self.stop_ids
    }

    pub fn is_stop(&self, id: u32) -> bool {
        self.stop_ids.contains(&id)
    }

    /// Render and tokenize `context` so that the prompt plus a reserve for
    /// the reply fits the context window.
    ///
    /// Oldest non-system turns go first; if the rest is still too long only
    /// the tail of the token sequence is kept.
    pub fn prepare_prompt(
        &self,
        context: &ConversationContext,
        max_new_tokens: usize,
    ) -> Result<Vec<u32>, GenerationError> {
        if context.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        let window = self.transformer.max_positions();
        let reserve = max_new_tokens.clamp(1, (window / 4).max(1));
        let budget = window.saturating_sub(reserve).max(1);

        let mut context = context.clone();
        loop {
            let prompt = self.template.render(&context);
            let tokens = self.tokenizer.encode(&prompt, true);
            if tokens.is_empty() {
                return Err(GenerationError::EmptyPrompt);
            }
            if tokens.len() <= budget {
                return Ok(tokens);
            }
            if !context.drop_oldest_turn() {
                warn!(
                    tokens = tokens.len(),
                    budget,
                    "prompt exceeds the context window, keeping its tail"
                );
                return Ok(keep_tail(&tokens, budget, self.tokenizer.bos_id()));
            }
            warn!(tokens = tokens.len(), budget, "dropped oldest turn to fit the context window");
        }
    }
}

/// Last `budget` tokens, with a leading BOS carried over.
fn keep_tail(tokens: &[u32], budget: usize, bos: Option<u32>) -> Vec<u32> {
    let mut kept = Vec::with_capacity(budget);
    kept.extend(bos.filter(|b| tokens.first() == Some(b)));
    let tail = budget.saturating_sub(kept.len());
    kept.extend_from_slice(&tokens[tokens.len().saturating_sub(tail)..]);
    kept
}

/// Read `config.json`, every container and `tokenizer.json` from `dir`.
///
/// `progress` climbs to 0.95; the remainder belongs to warm-up.
pub fn load_model<F: FnMut(f32)>(
    dir: &Path,
    options: &LoadOptions,
    mut progress: F,
) -> Result<LoadedModel, LoadError> {
    info!(dir = %dir.display(), "loading model");
    let mut config = ModelConfig::from_json_str(&fs::read_to_string(dir.join(CONFIG_FILE))?)?;
    if let Some(scheme) = options.quantization {
        config.quantization = scheme;
    }
    progress(0.05);

    let containers = ContainerSet::open_dir(dir, |done, total| {
        progress(0.05 + 0.05 * done as f32 / total as f32)
    })?;
    progress(0.10);

    let dequantizer = config.quantization.build()?;
    let transformer = Transformer::from_source(config, &containers, dequantizer.as_ref(), |f| {
        progress(0.10 + 0.80 * f)
    })?;
    drop(containers);
    progress(0.90);

    let tokenizer = Tokenizer::from_file(dir.join(TOKENIZER_FILE))?;
    progress(0.95);

    LoadedModel::new(transformer, tokenizer)
}
