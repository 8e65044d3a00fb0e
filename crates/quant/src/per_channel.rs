use crate::error::Result;
use crate::scheme::{rows_cols, Dequantizer, QuantizedTensor};

/// One scale (and optional zero point) per output row.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerChannel;

impl Dequantizer for PerChannel {
    fn name(&self) -> &'static str {
        "per_channel"
    }

    fn scale_count(&self, shape: &[usize]) -> usize {
        rows_cols(shape).0
    }

    fn dequantize(&self, tensor: &QuantizedTensor<'_>) -> Result<Vec<f32>> {
        let (rows, cols) = tensor.rows_cols();
        tensor.check(rows)?;
        let mut out = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            let scale = tensor.scales[r];
            let zero = tensor.zero_points.map_or(0.0, |zp| zp[r]);
            for c in 0..cols {
                out.push((tensor.value(r * cols + c) - zero) * scale);
            }
        }
        Ok(out)
    }
}

/// Symmetric int8 quantization with one scale per row.
pub fn quantize_per_channel(values: &[f32], shape: &[usize]) -> (Vec<u8>, Vec<f32>) {
    let (rows, cols) = rows_cols(shape);
    let mut quantized = Vec::with_capacity(values.len());
    let mut scales = Vec::with_capacity(rows);
    for row in values.chunks(cols.max(1)).take(rows) {
        let max = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let scale = if max > 0.0 { max / 127.0 } else { 1.0 };
        scales.push(scale);
        quantized.extend(row.iter().map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8 as u8));
    }
    (quantized, scales)
}
