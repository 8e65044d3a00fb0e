use std::fmt;
use std::path::Path;

use quant::QuantScheme;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::CoreError;

/// Feed-forward gate activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Silu,
    /// GELU with the tanh approximation.
    GeluTanh,
    Relu,
}

impl Activation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "silu" | "swish" => Some(Activation::Silu),
            "gelu" | "gelu_new" | "gelu_tanh" | "gelu_pytorch_tanh" | "gelu_fast" => {
                Some(Activation::GeluTanh)
            }
            "relu" => Some(Activation::Relu),
            _ => None,
        }
    }

    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Silu => x / (1.0 + (-x).exp()),
            Activation::GeluTanh => {
                const SQRT_2_OVER_PI: f32 = 0.797_884_6;
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
            }
            Activation::Relu => x.max(0.0),
        }
    }
}

/// Architecture family, derived from `model_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Llama,
    /// Scaled embeddings and `1 + w` norm weights.
    Gemma,
}

impl Family {
    pub fn from_model_type(model_type: &str) -> Self {
        if model_type.starts_with("gemma") {
            Family::Gemma
        } else {
            Family::Llama
        }
    }

    pub fn default_activation(self) -> Activation {
        match self {
            Family::Llama => Activation::Silu,
            Family::Gemma => Activation::GeluTanh,
        }
    }

    pub fn norm_weight_offset(self) -> f32 {
        match self {
            Family::Llama => 0.0,
            Family::Gemma => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub model_type: String,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Width of the residual stream.
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    /// Fewer than `num_attention_heads` means grouped-query attention.
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    /// Maximum context window.
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub attention_bias: bool,
    pub mlp_bias: bool,
    /// Training-time only, kept so documents round-trip.
    pub attention_dropout: f64,
    pub hidden_activation: Activation,
    pub tie_word_embeddings: bool,
    pub bos_token_id: Option<u32>,
    #[serde(rename = "eos_token_id")]
    pub eos_token_ids: Vec<u32>,
    pub quantization: QuantScheme,
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| ConfigError::single("<document>", Problem::Invalid(e.to_string())))?;
        Self::from_value(&value)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&text)?)
    }

    /// Decode a configuration document, collecting every violation.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let Value::Object(map) = value else {
            return Err(ConfigError::single(
                "<document>",
                Problem::Invalid("expected a JSON object".to_string()),
            ));
        };
        let mut f = Fields::new(map);

        let model_type = f.string(&["model_type"]).unwrap_or_else(|| "llama".to_string());
        let family = Family::from_model_type(&model_type);

        let layers = f.count(&["num_hidden_layers", "n_layer", "n_layers", "num_layers"]);
        let hidden = f.count(&["hidden_size", "n_embd", "d_model"]);
        let heads = f.count(&["num_attention_heads", "n_head", "n_heads"]);
        let vocab = f.count(&["vocab_size"]);
        let intermediate = f.count(&["intermediate_size", "ffn_dim", "n_inner"]);

        let kv_heads = f.opt_count(&["num_key_value_heads", "n_kv_heads", "num_kv_heads"]);
        let head_dim = f.opt_count(&["head_dim"]);
        let max_positions = f
            .opt_count(&["max_position_embeddings", "n_positions", "max_seq_len"])
            .unwrap_or(2048);
        let eps = f.positive_float(&["rms_norm_eps", "layer_norm_epsilon", "norm_eps"], 1e-6);
        let theta = f.positive_float(&["rope_theta"], 10_000.0);
        let attention_dropout = f.float(&["attention_dropout"]).unwrap_or(0.0);
        if !(0.0..1.0).contains(&attention_dropout) {
            f.invalid("attention_dropout", "must be in [0, 1)");
        }
        let attention_bias = f.flag(&["attention_bias"]).unwrap_or(false);
        let mlp_bias = f.flag(&["mlp_bias"]).unwrap_or(false);
        let activation = f
            .activation(&["hidden_activation", "hidden_act"])
            .unwrap_or_else(|| family.default_activation());
        let tie_word_embeddings = f.flag(&["tie_word_embeddings"]).unwrap_or(true);
        let bos_token_id = f.token_ids(&["bos_token_id"]).and_then(|ids| ids.first().copied());
        let eos_token_ids = f.token_ids(&["eos_token_id", "eos_token_ids"]).unwrap_or_default();
        let quantization = f.quant_scheme(&["quantization"]).unwrap_or_default();

        let kv_heads = match (heads, kv_heads) {
            (Some(heads), Some(kv)) => {
                if kv > heads {
                    f.invalid(
                        "num_key_value_heads",
                        format!("{kv} exceeds num_attention_heads ({heads})"),
                    );
                } else if heads % kv != 0 {
                    f.invalid(
                        "num_key_value_heads",
                        format!("{kv} does not divide num_attention_heads ({heads})"),
                    );
                }
                Some(kv)
            }
            (heads, None) => heads,
            (None, kv) => kv,
        };

        let head_dim = match (head_dim, hidden, heads) {
            (Some(d), _, _) => Some(d),
            (None, Some(hidden), Some(heads)) => {
                if hidden % heads != 0 {
                    f.invalid(
                        "hidden_size",
                        format!("{hidden} is not divisible by num_attention_heads ({heads})"),
                    );
                }
                Some(hidden / heads)
            }
            _ => None,
        };
        if let Some(d) = head_dim {
            if d % 2 != 0 {
                f.invalid("head_dim", format!("{d} is odd, rotary encoding needs pairs"));
            }
        }

        match (layers, hidden, heads, vocab, intermediate, kv_heads, head_dim) {
            (
                Some(num_hidden_layers),
                Some(hidden_size),
                Some(num_attention_heads),
                Some(vocab_size),
                Some(intermediate_size),
                Some(num_key_value_heads),
                Some(head_dim),
            ) if f.violations.is_empty() => Ok(ModelConfig {
                model_type,
                num_hidden_layers,
                hidden_size,
                num_attention_heads,
                num_key_value_heads,
                head_dim,
                intermediate_size,
                vocab_size,
                max_position_embeddings: max_positions,
                rms_norm_eps: eps,
                rope_theta: theta,
                attention_bias,
                mlp_bias,
                attention_dropout,
                hidden_activation: activation,
                tie_word_embeddings,
                bos_token_id,
                eos_token_ids,
                quantization,
            }),
            _ => Err(ConfigError {
                violations: f.violations,
            }),
        }
    }

    pub fn family(&self) -> Family {
        Family::from_model_type(&self.model_type)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Query heads sharing one key/value head.
    pub fn kv_group_size(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    pub fn q_dim(&self) -> usize {
        self.num_attention_heads * self.head_dim
    }

    pub fn kv_dim(&self) -> usize {
        self.num_key_value_heads * self.head_dim
    }

    pub fn to_json(&self) -> String {
        // Every field is plain data, serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Problem {
    Missing,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigViolation {
    pub field: String,
    pub problem: Problem,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            Problem::Missing => write!(f, "{}: missing", self.field),
            Problem::Invalid(why) => write!(f, "{}: {}", self.field, why),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid model config: {}", list(.violations))]
pub struct ConfigError {
    pub violations: Vec<ConfigViolation>,
}

fn list(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    fn single(field: &str, problem: Problem) -> Self {
        Self {
            violations: vec![ConfigViolation {
                field: field.to_string(),
                problem,
            }],
        }
    }

    pub fn missing_fields(&self) -> Vec<&str> {
        self.violations
            .iter()
            .filter(|v| v.problem == Problem::Missing)
            .map(|v| v.field.as_str())
            .collect()
    }

    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

/// Reads fields under their canonical name or any alias, recording problems.
struct Fields<'a> {
    map: &'a Map<String, Value>,
    violations: Vec<ConfigViolation>,
}

impl<'a> Fields<'a> {
    fn new(map: &'a Map<String, Value>) -> Self {
        Self {
            map,
            violations: Vec::new(),
        }
    }

    fn lookup(&self, names: &[&str]) -> Option<&'a Value> {
        names
            .iter()
            .filter_map(|n| self.map.get(*n))
            .find(|v| !v.is_null())
    }

    fn invalid(&mut self, field: &str, why: impl Into<String>) {
        self.violations.push(ConfigViolation {
            field: field.to_string(),
            problem: Problem::Invalid(why.into()),
        });
    }

    fn count(&mut self, names: &[&str]) -> Option<usize> {
        if self.lookup(names).is_none() {
            self.violations.push(ConfigViolation {
                field: names[0].to_string(),
                problem: Problem::Missing,
            });
            return None;
        }
        self.opt_count(names)
    }

    fn opt_count(&mut self, names: &[&str]) -> Option<usize> {
        let value = self.lookup(names)?;
        match value.as_u64().and_then(|n| usize::try_from(n).ok()) {
            Some(0) => {
                self.invalid(names[0], "must be positive");
                None
            }
            Some(n) => Some(n),
            None => {
                self.invalid(names[0], format!("expected a positive integer, found {value}"));
                None
            }
        }
    }

    fn float(&mut self, names: &[&str]) -> Option<f64> {
        let value = self.lookup(names)?;
        match value.as_f64() {
            Some(x) if x.is_finite() => Some(x),
            _ => {
                self.invalid(names[0], format!("expected a number, found {value}"));
                None
            }
        }
    }

    fn positive_float(&mut self, names: &[&str], default: f64) -> f64 {
        match self.lookup(names).map(|_| self.float(names)) {
            None => default,
            Some(Some(x)) if x > 0.0 => x,
            Some(Some(_)) => {
                self.invalid(names[0], "must be positive");
                default
            }
            Some(None) => default,
        }
    }

    fn flag(&mut self, names: &[&str]) -> Option<bool> {
        let value = self.lookup(names)?;
        match value.as_bool() {
            Some(b) => Some(b),
            None => {
                self.invalid(names[0], format!("expected a boolean, found {value}"));
                None
            }
        }
    }

    fn string(&mut self, names: &[&str]) -> Option<String> {
        let value = self.lookup(names)?;
        match value.as_str() {
            Some(s) => Some(s.to_string()),
            None => {
                self.invalid(names[0], format!("expected a string, found {value}"));
                None
            }
        }
    }

    fn activation(&mut self, names: &[&str]) -> Option<Activation> {
        let name = self.string(names)?;
        let parsed = Activation::parse(&name);
        if parsed.is_none() {
            self.invalid(names[0], format!("unsupported activation {name}"));
        }
        parsed
    }

    fn token_ids(&mut self, names: &[&str]) -> Option<Vec<u32>> {
        let value = self.lookup(names)?;
        let as_id = |v: &Value| v.as_u64().and_then(|n| u32::try_from(n).ok());
        let ids = match value {
            Value::Array(items) => items.iter().map(as_id).collect::<Option<Vec<_>>>(),
            single => as_id(single).map(|id| vec![id]),
        };
        if ids.is_none() {
            self.invalid(names[0], format!("expected token id(s), found {value}"));
        }
        ids
    }

    fn quant_scheme(&mut self, names: &[&str]) -> Option<QuantScheme> {
        let value = self.lookup(names)?;
        match QuantScheme::deserialize(value) {
            Ok(scheme) => Some(scheme),
            Err(e) => {
                self.invalid(names[0], e.to_string());
                None
            }
        }
    }
}
