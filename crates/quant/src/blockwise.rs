use crate::error::{QuantError, Result};
use crate::scheme::{rows_cols, Dequantizer, QuantizedTensor};

/// One scale per `block_size` consecutive elements of a row.
///
/// A row whose length is not a multiple of the block size ends with a short
/// block that still gets its own scale.
#[derive(Debug, Clone, Copy)]
pub struct Blockwise {
    block_size: usize,
}

impl Blockwise {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(QuantError::InvalidBlockSize);
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn blocks_per_row(&self, cols: usize) -> usize {
        cols.div_ceil(self.block_size)
    }
}

impl Dequantizer for Blockwise {
    fn name(&self) -> &'static str {
        "blockwise"
    }

    fn scale_count(&self, shape: &[usize]) -> usize {
        let (rows, cols) = rows_cols(shape);
        rows * self.blocks_per_row(cols)
    }

    fn dequantize(&self, tensor: &QuantizedTensor<'_>) -> Result<Vec<f32>> {
        let (rows, cols) = tensor.rows_cols();
        let per_row = self.blocks_per_row(cols);
        tensor.check(rows * per_row)?;
        let mut out = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                let block = r * per_row + c / self.block_size;
                let zero = tensor.zero_points.map_or(0.0, |zp| zp[block]);
                out.push((tensor.value(r * cols + c) - zero) * tensor.scales[block]);
            }
        }
        Ok(out)
    }
}
