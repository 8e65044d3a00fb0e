use std::sync::Arc;

use rayon::prelude::*;

use crate::config::ModelConfig;
use crate::kv_cache::KvCache;
use crate::linear::dot;
use crate::rotary::RotaryEmbedding;
use crate::weights::Projection;

/// Query, key and value vectors of one position, rotary already applied.
#[derive(Debug, Clone)]
pub struct Qkv {
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
}

/// Grouped-query self attention of one layer.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
    heads: HeadLayout,
    rotary: Arc<RotaryEmbedding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLayout {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl HeadLayout {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim,
        }
    }

    /// Key/value head read by query head `h`.
    #[inline]
    pub fn kv_head(&self, h: usize) -> usize {
        h / (self.num_heads / self.num_kv_heads)
    }

    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

impl Attention {
    pub fn new(
        [q_proj, k_proj, v_proj, o_proj]: [Projection; 4],
        heads: HeadLayout,
        rotary: Arc<RotaryEmbedding>,
    ) -> Self {
        Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            heads,
            rotary,
        }
    }

    pub fn project(&self, x: &[f32], position: usize) -> Qkv {
        let mut q = self.q_proj.forward(x);
        let mut k = self.k_proj.forward(x);
        let v = self.v_proj.forward(x);
        self.rotary.apply(&mut q, position);
        self.rotary.apply(&mut k, position);
        Qkv { q, k, v }
    }

    /// Attend over every cached position of `layer` and project the result.
    pub fn forward(&self, x: &[f32], position: usize, cache: &mut KvCache, layer: usize) -> Vec<f32> {
        let Qkv { q, k, v } = self.project(x, position);
        cache.append(layer, &k, &v);
        let mixed = attend(&q, cache.keys(layer), cache.values(layer), self.heads, None);
        self.o_proj.forward(&mixed)
    }

    /// Attend over explicit keys and values, hiding positions where `mask` is false.
    pub fn combine(&self, q: &[f32], keys: &[f32], values: &[f32], mask: &[bool]) -> Vec<f32> {
        let mixed = attend(q, keys, values, self.heads, Some(mask));
        self.o_proj.forward(&mixed)
    }
}

/// Scaled dot-product attention of one query position.
///
/// `keys` and `values` hold `[position][kv_head][head_dim]`. Softmax is
/// max-subtracted and accumulated in `f64`.
pub fn attend(q: &[f32], keys: &[f32], values: &[f32], heads: HeadLayout, mask: Option<&[bool]>) -> Vec<f32> {
    let d = heads.head_dim;
    let kv_dim = heads.kv_dim();
    let positions = keys.len() / kv_dim;
    let scale = 1.0 / (d as f64).sqrt();
    let visible = |j: usize| mask.map_or(true, |m| m[j]);

    let mut out = vec![0.0f32; heads.num_heads * d];
    out.par_chunks_mut(d).enumerate().for_each(|(h, out_h)| {
        let q_h = &q[h * d..(h + 1) * d];
        let offset = heads.kv_head(h) * d;

        let scores: Vec<Option<f64>> = (0..positions)
            .map(|j| {
                visible(j).then(|| {
                    let k = &keys[j * kv_dim + offset..j * kv_dim + offset + d];
                    f64::from(dot(q_h, k)) * scale
                })
            })
            .collect();
        let max = scores.iter().flatten().fold(f64::NEG_INFINITY, |m, s| m.max(*s));

        let mut acc = vec![0.0f64; d];
        let mut total = 0.0f64;
        for (j, score) in scores.iter().enumerate() {
            let Some(score) = score else { continue };
            let w = (score - max).exp();
            total += w;
            let v = &values[j * kv_dim + offset..j * kv_dim + offset + d];
            for (a, x) in acc.iter_mut().zip(v) {
                *a += w * f64::from(*x);
            }
        }
        for (o, a) in out_h.iter_mut().zip(&acc) {
            *o = (a / total) as f32;
        }
    });
    out
}

/// Row `i` is true at columns `0..=i`.
pub fn causal_mask(n: usize) -> Vec<bool> {
    (0..n * n).map(|idx| idx % n <= idx / n).collect()
}
