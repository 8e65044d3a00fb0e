use rayon::prelude::*;

use crate::weights::{Projection, WeightHandle};

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `weight · x` for a row-major `[rows, cols]` weight, rows computed in parallel.
pub fn matvec(weight: &WeightHandle, x: &[f32]) -> Vec<f32> {
    debug_assert_eq!(weight.cols(), x.len());
    weight
        .data()
        .par_chunks(weight.cols().max(1))
        .map(|row| dot(row, x))
        .collect()
}

impl Projection {
    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let mut out = matvec(&self.weight, x);
        if let Some(bias) = &self.bias {
            add_assign(&mut out, bias.data());
        }
        out
    }

    pub fn out_features(&self) -> usize {
        self.weight.rows()
    }
}

pub fn add_assign(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

pub fn all_finite(xs: &[f32]) -> bool {
    xs.iter().all(|x| x.is_finite())
}
