use std::sync::Arc;

use quant::Dequantizer;
use tensors::TensorSource;
use tracing::{debug, info};

use crate::attention::{causal_mask, Attention, HeadLayout};
use crate::config::{Activation, Family, ModelConfig};
use crate::error::{CoreError, Result};
use crate::kv_cache::KvCache;
use crate::layer_norm::RmsNorm;
use crate::linear::{add_assign, all_finite, matvec};
use crate::rotary::RotaryEmbedding;
use crate::weights::{LayerWeights, Projection, WeightHandle, WeightStore};

/// Gated feed-forward block: `down(act(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    gate_proj: Projection,
    up_proj: Projection,
    down_proj: Projection,
    activation: Activation,
}

impl FeedForward {
    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let gate = self.gate_proj.forward(x);
        let up = self.up_proj.forward(x);
        let hidden: Vec<f32> = gate
            .iter()
            .zip(&up)
            .map(|(g, u)| self.activation.apply(*g) * u)
            .collect();
        self.down_proj.forward(&hidden)
    }
}

/// One decoder layer.
#[derive(Debug, Clone)]
pub struct Block {
    input_norm: RmsNorm,
    attn: Attention,
    post_attention_norm: RmsNorm,
    mlp: FeedForward,
}

impl Block {
    fn new(weights: LayerWeights, config: &ModelConfig, rotary: Arc<RotaryEmbedding>) -> Self {
        let offset = config.family().norm_weight_offset();
        let LayerWeights {
            input_layernorm,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            post_attention_layernorm,
            gate_proj,
            up_proj,
            down_proj,
        } = weights;
        Self {
            input_norm: RmsNorm::new(&input_layernorm, config.rms_norm_eps, offset),
            attn: Attention::new(
                [q_proj, k_proj, v_proj, o_proj],
                HeadLayout::from_config(config),
                rotary,
            ),
            post_attention_norm: RmsNorm::new(&post_attention_layernorm, config.rms_norm_eps, offset),
            mlp: FeedForward {
                gate_proj,
                up_proj,
                down_proj,
                activation: config.hidden_activation,
            },
        }
    }

    /// Incremental step: appends this position's key/value to `cache`.
    pub fn forward(&self, x: &mut [f32], position: usize, cache: &mut KvCache, layer: usize) {
        let normed = self.input_norm.forward(x);
        let attn_out = self.attn.forward(&normed, position, cache, layer);
        add_assign(x, &attn_out);
        self.feed_forward_residual(x);
    }

    fn feed_forward_residual(&self, x: &mut [f32]) {
        let normed = self.post_attention_norm.forward(x);
        let mlp_out = self.mlp.forward(&normed);
        add_assign(x, &mlp_out);
    }
}

/// Decoder-only transformer evaluated one token at a time on the CPU.
#[derive(Debug, Clone)]
pub struct Transformer {
    config: ModelConfig,
    embed_tokens: WeightHandle,
    embed_scale: f32,
    blocks: Vec<Block>,
    norm: RmsNorm,
    lm_head: Option<WeightHandle>,
}

impl Transformer {
    pub fn new(config: ModelConfig, weights: WeightStore) -> Self {
        let rotary = Arc::new(RotaryEmbedding::new(config.head_dim, config.rope_theta));
        let family = config.family();
        let embed_scale = match family {
            Family::Gemma => (config.hidden_size as f32).sqrt(),
            Family::Llama => 1.0,
        };
        let WeightStore {
            embed_tokens,
            layers,
            norm,
            lm_head,
        } = weights;
        let blocks = layers
            .into_iter()
            .map(|l| Block::new(l, &config, Arc::clone(&rotary)))
            .collect();
        let norm = RmsNorm::new(&norm, config.rms_norm_eps, family.norm_weight_offset());
        Self {
            config,
            embed_tokens,
            embed_scale,
            blocks,
            norm,
            lm_head,
        }
    }

    /// Resolve weights from `source` and build the model.
    pub fn from_source<S, F>(
        config: ModelConfig,
        source: &S,
        dequantizer: &dyn Dequantizer,
        progress: F,
    ) -> Result<Self>
    where
        S: TensorSource + ?Sized,
        F: FnMut(f32),
    {
        let weights = WeightStore::resolve(&config, source, dequantizer, progress)?;
        info!(
            model_type = %config.model_type,
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            "transformer ready"
        );
        Ok(Self::new(config, weights))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    pub fn new_cache(&self) -> KvCache {
        KvCache::new(
            self.blocks.len(),
            self.config.kv_dim(),
            self.config.max_position_embeddings,
        )
    }

    /// Logits for `token` at position `cache.len()`, extending the cache.
    pub fn forward(&self, token: u32, cache: &mut KvCache) -> Result<Vec<f32>> {
        self.check_cache(cache, 1)?;
        self.check_token(token)?;
        let hidden = self.step(token, cache)?;
        self.logits(&hidden, cache)
    }

    /// Run every token through the cache and return the logits of the last one.
    pub fn prefill(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Vec<f32>> {
        let Some((&last, rest)) = tokens.split_last() else {
            return Err(CoreError::EmptyInput);
        };
        self.check_cache(cache, tokens.len())?;
        for &token in tokens {
            self.check_token(token)?;
        }
        debug!(tokens = tokens.len(), start = cache.len(), "prefill");
        for &token in rest {
            self.step(token, cache)?;
        }
        let hidden = self.step(last, cache)?;
        self.logits(&hidden, cache)
    }

    /// Logits at every position, recomputed without a cache under an explicit
    /// causal mask.
    pub fn forward_sequence(&self, tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        let n = tokens.len();
        if n == 0 {
            return Err(CoreError::EmptyInput);
        }
        if n > self.max_positions() {
            return Err(CoreError::ContextOverflow {
                max: self.max_positions(),
            });
        }
        for &token in tokens {
            self.check_token(token)?;
        }

        let mask = causal_mask(n);
        let mut hidden: Vec<Vec<f32>> = tokens.iter().map(|&t| self.embed(t)).collect();
        for (layer, block) in self.blocks.iter().enumerate() {
            let qkv: Vec<_> = hidden
                .iter()
                .enumerate()
                .map(|(pos, x)| block.attn.project(&block.input_norm.forward(x), pos))
                .collect();
            let keys: Vec<f32> = qkv.iter().flat_map(|p| p.k.iter().copied()).collect();
            let values: Vec<f32> = qkv.iter().flat_map(|p| p.v.iter().copied()).collect();
            for (pos, x) in hidden.iter_mut().enumerate() {
                let row = &mask[pos * n..(pos + 1) * n];
                let attn_out = block.attn.combine(&qkv[pos].q, &keys, &values, row);
                add_assign(x, &attn_out);
                block.feed_forward_residual(x);
                if !all_finite(x) {
                    return Err(CoreError::Compute {
                        layer: Some(layer),
                        position: pos,
                    });
                }
            }
        }
        hidden
            .iter()
            .enumerate()
            .map(|(pos, x)| self.project_vocab(x, pos))
            .collect()
    }

    fn check_cache(&self, cache: &KvCache, extra: usize) -> Result<()> {
        if !cache.is_valid() {
            return Err(CoreError::InvalidCache);
        }
        if cache.len() + extra > self.max_positions() {
            return Err(CoreError::ContextOverflow {
                max: self.max_positions(),
            });
        }
        Ok(())
    }

    fn check_token(&self, token: u32) -> Result<()> {
        if token as usize >= self.vocab_size() {
            return Err(CoreError::TokenOutOfRange {
                id: token,
                vocab_size: self.vocab_size(),
            });
        }
        Ok(())
    }

    fn embed(&self, token: u32) -> Vec<f32> {
        self.embed_tokens
            .row(token as usize)
            .iter()
            .map(|v| v * self.embed_scale)
            .collect()
    }

    /// Advance the cache by one position and return the last hidden state.
    fn step(&self, token: u32, cache: &mut KvCache) -> Result<Vec<f32>> {
        let position = cache.len();
        let mut x = self.embed(token);
        for (layer, block) in self.blocks.iter().enumerate() {
            block.forward(&mut x, position, cache, layer);
            if !all_finite(&x) {
                cache.invalidate();
                return Err(CoreError::Compute {
                    layer: Some(layer),
                    position,
                });
            }
        }
        cache.commit();
        Ok(x)
    }

    fn logits(&self, hidden: &[f32], cache: &mut KvCache) -> Result<Vec<f32>> {
        let position = cache.len().saturating_sub(1);
        self.project_vocab(hidden, position).map_err(|e| {
            cache.invalidate();
            e
        })
    }

    fn project_vocab(&self, hidden: &[f32], position: usize) -> Result<Vec<f32>> {
        let normed = self.norm.forward(hidden);
        let head = self.lm_head.as_ref().unwrap_or(&self.embed_tokens);
        let logits = matvec(head, &normed);
        if !all_finite(&logits) {
            return Err(CoreError::Compute {
                layer: None,
                position,
            });
        }
        Ok(logits)
    }
}
