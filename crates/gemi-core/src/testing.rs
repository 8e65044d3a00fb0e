//! Tiny randomly initialized models for tests in this and downstream crates.

use std::path::Path;

use quant::{quantize_per_channel, PerChannel, QuantScheme};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tensors::{Container, ContainerWriter, Dtype};

use crate::config::{Family, ModelConfig};
use crate::error::Result;
use crate::transformer::Transformer;
use crate::weights::{required_weights, scale_name};

/// How [`random_writer`] stores each 2-d weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    F32,
    Bf16,
    /// Symmetric int8 with one scale per row.
    Int8,
}

/// Two layers, grouped-query attention, 64-token vocabulary.
pub fn tiny_config(family: Family) -> ModelConfig {
    let model_type = match family {
        Family::Gemma => "gemma",
        Family::Llama => "llama",
    };
    ModelConfig {
        model_type: model_type.to_string(),
        num_hidden_layers: 2,
        hidden_size: 16,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        head_dim: 4,
        intermediate_size: 32,
        vocab_size: 64,
        max_position_embeddings: 64,
        rms_norm_eps: 1e-6,
        rope_theta: 10_000.0,
        attention_bias: false,
        mlp_bias: false,
        attention_dropout: 0.0,
        hidden_activation: family.default_activation(),
        tie_word_embeddings: true,
        bos_token_id: Some(2),
        eos_token_ids: vec![1],
        quantization: QuantScheme::PerChannel,
    }
}

/// Every tensor `config` requires, filled from a seeded RNG.
///
/// The same seed yields the same underlying values in every format.
pub fn random_writer(config: &ModelConfig, seed: u64, format: WeightFormat) -> tensors::Result<ContainerWriter> {
    let mut rng = StdRng::seed_from_u64(seed);
    let norm_base = config.family().norm_weight_offset();
    let mut writer = ContainerWriter::new();
    writer.set_metadata("format", "pt");

    for w in required_weights(config) {
        let numel: usize = w.shape.iter().product();
        let is_norm = w.name.ends_with("norm.weight");
        let values: Vec<f32> = if is_norm {
            (0..numel).map(|_| 1.0 - norm_base + rng.gen_range(-0.1..0.1)).collect()
        } else {
            let cols = w.shape.get(1).copied().unwrap_or(w.shape[0]);
            let bound = 1.5 / (cols as f32).sqrt();
            (0..numel).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        match format {
            WeightFormat::Int8 if w.shape.len() == 2 => {
                let (q, scales) = quantize_per_channel(&values, &w.shape);
                writer.add_raw(&w.name, Dtype::I8, &w.shape, &q)?;
                writer.add_f32(&scale_name(&w.name), &[w.shape[0]], &scales)?;
            }
            WeightFormat::Bf16 => writer.add_as(&w.name, Dtype::BF16, &w.shape, &values)?,
            _ => writer.add_f32(&w.name, &w.shape, &values)?,
        }
    }
    Ok(writer)
}

pub fn random_container(config: &ModelConfig, seed: u64, format: WeightFormat) -> Result<Container> {
    Ok(Container::from_bytes(random_writer(config, seed, format)?.to_bytes())?)
}

pub fn random_transformer(config: &ModelConfig, seed: u64) -> Result<Transformer> {
    let source = random_container(config, seed, WeightFormat::F32)?;
    Transformer::from_source(config.clone(), &source, &PerChannel, |_| {})
}

/// Write `config.json` and `model.safetensors` into `dir`.
pub fn write_model_dir(dir: &Path, config: &ModelConfig, seed: u64, format: WeightFormat) -> Result<()> {
    std::fs::write(dir.join("config.json"), config.to_json())?;
    random_writer(config, seed, format)?.write_to(dir.join("model.safetensors"))?;
    Ok(())
}
