use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blockwise::Blockwise;
use crate::error::{QuantError, Result};
use crate::per_channel::PerChannel;

/// Borrowed view of an integer-quantized tensor and its scale parameters.
#[derive(Debug, Clone, Copy)]
pub struct QuantizedTensor<'a> {
    pub name: &'a str,
    pub shape: &'a [usize],
    /// Raw element bytes, one byte per element.
    pub values: &'a [u8],
    /// `true` for I8 storage, `false` for U8.
    pub signed: bool,
    pub scales: &'a [f32],
    pub zero_points: Option<&'a [f32]>,
}

impl<'a> QuantizedTensor<'a> {
    /// Rows and elements per row; 0-d and 1-d tensors are a single row.
    pub fn rows_cols(&self) -> (usize, usize) {
        rows_cols(self.shape)
    }

    pub(crate) fn value(&self, i: usize) -> f32 {
        let byte = self.values[i];
        if self.signed {
            byte as i8 as f32
        } else {
            byte as f32
        }
    }

    pub(crate) fn check(&self, expected_scales: usize) -> Result<()> {
        let numel: usize = self.shape.iter().product();
        if self.values.len() != numel {
            return Err(QuantError::ValueCount {
                name: self.name.to_string(),
                shape: self.shape.to_vec(),
                actual: self.values.len(),
            });
        }
        if self.scales.len() != expected_scales {
            return Err(QuantError::ScaleCount {
                name: self.name.to_string(),
                expected: expected_scales,
                actual: self.scales.len(),
            });
        }
        if let Some(zp) = self.zero_points {
            if zp.len() != expected_scales {
                return Err(QuantError::ZeroPointCount {
                    name: self.name.to_string(),
                    expected: expected_scales,
                    actual: zp.len(),
                });
            }
        }
        Ok(())
    }
}

pub fn rows_cols(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (1, *n),
        [rows, rest @ ..] => (*rows, rest.iter().product()),
    }
}

/// Strategy that turns integer weights plus scales back into `f32`.
pub trait Dequantizer: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// How many scale (and zero point) values a tensor of `shape` carries.
    fn scale_count(&self, shape: &[usize]) -> usize;

    fn dequantize(&self, tensor: &QuantizedTensor<'_>) -> Result<Vec<f32>>;
}

/// Serializable choice of dequantization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum QuantScheme {
    #[default]
    PerChannel,
    Blockwise {
        block_size: usize,
    },
}

impl QuantScheme {
    pub fn build(self) -> Result<Arc<dyn Dequantizer>> {
        debug!(scheme = ?self, "selecting dequantizer");
        Ok(match self {
            QuantScheme::PerChannel => Arc::new(PerChannel),
            QuantScheme::Blockwise { block_size } => Arc::new(Blockwise::new(block_size)?),
        })
    }
}
