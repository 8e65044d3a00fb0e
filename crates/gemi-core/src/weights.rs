//! Resolution of named container tensors into the `f32` weights the runtime
//! computes with.
//!
//! Everything is validated before any conversion starts, so a broken model
//! directory reports all of its missing tensors (or all of its shape
//! mismatches) at once instead of failing on the first one.

use std::collections::HashMap;

use quant::{Dequantizer, QuantizedTensor};
use tensors::TensorSource;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{CoreError, Result, ShapeMismatch};

/// Read-only `f32` tensor owned by the weight store.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightHandle {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl WeightHandle {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn cols(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Row `i` of a 2-d weight.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }
}

/// Companion tensor holding the scales of a quantized weight.
pub fn scale_name(weight: &str) -> String {
    format!("{weight}_scale")
}

pub fn zero_point_name(weight: &str) -> String {
    format!("{weight}_zero_point")
}

/// A tensor the architecture requires, with its expected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredWeight {
    pub name: String,
    pub shape: Vec<usize>,
}

fn required(out: &mut Vec<RequiredWeight>, name: String, shape: Vec<usize>) {
    out.push(RequiredWeight { name, shape });
}

/// Every tensor `config` needs, in the order they are resolved.
pub fn required_weights(config: &ModelConfig) -> Vec<RequiredWeight> {
    let hidden = config.hidden_size;
    let q_dim = config.q_dim();
    let kv_dim = config.kv_dim();
    let inter = config.intermediate_size;

    let mut out = Vec::new();
    required(&mut out, "model.embed_tokens.weight".into(), vec![config.vocab_size, hidden]);
    for i in 0..config.num_hidden_layers {
        let p = format!("model.layers.{i}");
        required(&mut out, format!("{p}.input_layernorm.weight"), vec![hidden]);
        for (proj, rows, cols) in [
            ("q_proj", q_dim, hidden),
            ("k_proj", kv_dim, hidden),
            ("v_proj", kv_dim, hidden),
            ("o_proj", hidden, q_dim),
        ] {
            required(&mut out, format!("{p}.self_attn.{proj}.weight"), vec![rows, cols]);
            if config.attention_bias {
                required(&mut out, format!("{p}.self_attn.{proj}.bias"), vec![rows]);
            }
        }
        required(&mut out, format!("{p}.post_attention_layernorm.weight"), vec![hidden]);
        for (proj, rows, cols) in [
            ("gate_proj", inter, hidden),
            ("up_proj", inter, hidden),
            ("down_proj", hidden, inter),
        ] {
            required(&mut out, format!("{p}.mlp.{proj}.weight"), vec![rows, cols]);
            if config.mlp_bias {
                required(&mut out, format!("{p}.mlp.{proj}.bias"), vec![rows]);
            }
        }
    }
    required(&mut out, "model.norm.weight".into(), vec![hidden]);
    if !config.tie_word_embeddings {
        required(&mut out, "lm_head.weight".into(), vec![config.vocab_size, hidden]);
    }
    out
}

/// A linear projection and its optional bias.
#[derive(Debug, Clone)]
pub struct Projection {
    pub weight: WeightHandle,
    pub bias: Option<WeightHandle>,
}

#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub input_layernorm: WeightHandle,
    pub q_proj: Projection,
    pub k_proj: Projection,
    pub v_proj: Projection,
    pub o_proj: Projection,
    pub post_attention_layernorm: WeightHandle,
    pub gate_proj: Projection,
    pub up_proj: Projection,
    pub down_proj: Projection,
}

/// All weights of one model, converted to `f32`.
#[derive(Debug, Clone)]
pub struct WeightStore {
    pub embed_tokens: WeightHandle,
    pub layers: Vec<LayerWeights>,
    pub norm: WeightHandle,
    /// `None` when the output projection is tied to the embedding table.
    pub lm_head: Option<WeightHandle>,
}

impl WeightStore {
    /// Validate and convert every tensor `config` requires.
    ///
    /// `progress` receives the resolved fraction after each tensor.
    pub fn resolve<S, F>(
        config: &ModelConfig,
        source: &S,
        dequantizer: &dyn Dequantizer,
        mut progress: F,
    ) -> Result<Self>
    where
        S: TensorSource + ?Sized,
        F: FnMut(f32),
    {
        let wanted = required_weights(config);
        validate(&wanted, source)?;

        let total = wanted.len();
        let mut handles = HashMap::with_capacity(total);
        for (i, w) in wanted.into_iter().enumerate() {
            let data = convert(&w, source, dequantizer)?;
            debug!(tensor = %w.name, shape = ?w.shape, "resolved weight");
            handles.insert(w.name.clone(), WeightHandle::new(w.name, w.shape, data));
            progress((i + 1) as f32 / total as f32);
        }

        let store = Self::assemble(config, handles)?;
        info!(
            tensors = total,
            parameters = store.parameter_count(),
            scheme = dequantizer.name(),
            "weights resolved"
        );
        Ok(store)
    }

    fn assemble(config: &ModelConfig, handles: HashMap<String, WeightHandle>) -> Result<Self> {
        let mut handles = Handles(handles);
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let p = format!("model.layers.{i}");
            let attn_bias = config.attention_bias;
            let mlp_bias = config.mlp_bias;
            layers.push(LayerWeights {
                input_layernorm: handles.take(format!("{p}.input_layernorm.weight"))?,
                q_proj: handles.projection(&format!("{p}.self_attn.q_proj"), attn_bias)?,
                k_proj: handles.projection(&format!("{p}.self_attn.k_proj"), attn_bias)?,
                v_proj: handles.projection(&format!("{p}.self_attn.v_proj"), attn_bias)?,
                o_proj: handles.projection(&format!("{p}.self_attn.o_proj"), attn_bias)?,
                post_attention_layernorm: handles
                    .take(format!("{p}.post_attention_layernorm.weight"))?,
                gate_proj: handles.projection(&format!("{p}.mlp.gate_proj"), mlp_bias)?,
                up_proj: handles.projection(&format!("{p}.mlp.up_proj"), mlp_bias)?,
                down_proj: handles.projection(&format!("{p}.mlp.down_proj"), mlp_bias)?,
            });
        }
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(handles.take("lm_head.weight".to_string())?)
        };
        Ok(Self {
            embed_tokens: handles.take("model.embed_tokens.weight".to_string())?,
            layers,
            norm: handles.take("model.norm.weight".to_string())?,
            lm_head,
        })
    }

    /// The `[vocab, hidden]` matrix that maps hidden states to logits.
    pub fn output_projection(&self) -> &WeightHandle {
        self.lm_head.as_ref().unwrap_or(&self.embed_tokens)
    }

    pub fn parameter_count(&self) -> usize {
        let projection = |p: &Projection| {
            p.weight.data.len() + p.bias.as_ref().map_or(0, |b| b.data.len())
        };
        let layers: usize = self
            .layers
            .iter()
            .map(|l| {
                l.input_layernorm.data.len()
                    + l.post_attention_layernorm.data.len()
                    + [&l.q_proj, &l.k_proj, &l.v_proj, &l.o_proj, &l.gate_proj, &l.up_proj, &l.down_proj]
                        .into_iter()
                        .map(projection)
                        .sum::<usize>()
            })
            .sum();
        self.embed_tokens.data.len()
            + layers
            + self.norm.data.len()
            + self.lm_head.as_ref().map_or(0, |h| h.data.len())
    }
}

struct Handles(HashMap<String, WeightHandle>);

impl Handles {
    fn take(&mut self, name: String) -> Result<WeightHandle> {
        self.0
            .remove(&name)
            .ok_or_else(|| CoreError::MissingWeights(vec![name]))
    }

    fn projection(&mut self, prefix: &str, with_bias: bool) -> Result<Projection> {
        let weight = self.take(format!("{prefix}.weight"))?;
        let bias = if with_bias {
            Some(self.take(format!("{prefix}.bias"))?)
        } else {
            None
        };
        Ok(Projection { weight, bias })
    }
}

fn validate<S: TensorSource + ?Sized>(wanted: &[RequiredWeight], source: &S) -> Result<()> {
    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    for w in wanted {
        let Some(desc) = source.descriptor(&w.name) else {
            missing.push(w.name.clone());
            continue;
        };
        if desc.dtype.is_quantized() {
            let scale = scale_name(&w.name);
            if !source.contains(&scale) {
                missing.push(scale);
            }
        }
        if desc.shape != w.shape {
            mismatched.push(ShapeMismatch {
                name: w.name.clone(),
                expected: w.shape.clone(),
                actual: desc.shape.clone(),
            });
        }
    }
    if !missing.is_empty() {
        return Err(CoreError::MissingWeights(missing));
    }
    if !mismatched.is_empty() {
        return Err(CoreError::ShapeMismatch(mismatched));
    }
    Ok(())
}

fn convert<S: TensorSource + ?Sized>(
    w: &RequiredWeight,
    source: &S,
    dequantizer: &dyn Dequantizer,
) -> Result<Vec<f32>> {
    let dtype = source
        .descriptor(&w.name)
        .map(|d| d.dtype)
        .ok_or_else(|| CoreError::MissingWeights(vec![w.name.clone()]))?;
    if dtype.is_float() {
        return Ok(source.read_f32(&w.name)?);
    }
    if !dtype.is_quantized() {
        return Err(CoreError::UnsupportedDtype {
            name: w.name.clone(),
            dtype,
        });
    }

    let values = source.tensor_bytes(&w.name)?;
    let scales = source.read_f32(&scale_name(&w.name))?;
    let zp_name = zero_point_name(&w.name);
    let zero_points = if source.contains(&zp_name) {
        Some(source.read_f32(&zp_name)?)
    } else {
        None
    };
    let tensor = QuantizedTensor {
        name: &w.name,
        shape: &w.shape,
        values,
        signed: dtype == tensors::Dtype::I8,
        scales: &scales,
        zero_points: zero_points.as_deref(),
    };
    Ok(dequantizer.dequantize(&tensor)?)
}
