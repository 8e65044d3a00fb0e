use crate::weights::WeightHandle;

/// Root-mean-square normalization: `x * scale / sqrt(mean(x^2) + eps)`.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    scale: Vec<f32>,
    eps: f64,
}

impl RmsNorm {
    /// `offset` is added to every stored weight (1.0 for Gemma checkpoints).
    pub fn new(weight: &WeightHandle, eps: f64, offset: f32) -> Self {
        Self {
            scale: weight.data().iter().map(|w| w + offset).collect(),
            eps,
        }
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let mean_sq = x.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>() / x.len().max(1) as f64;
        let inv = (1.0 / (mean_sq + self.eps).sqrt()) as f32;
        x.iter().zip(&self.scale).map(|(v, s)| v * inv * s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_rms_after_normalizing() {
        let w = WeightHandle::new("n", vec![4], vec![1.0; 4]);
        let out = RmsNorm::new(&w, 1e-6, 0.0).forward(&[2.0, -2.0, 2.0, -2.0]);
        for v in out.iter().map(|v| v.abs()) {
            assert!((v - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn gemma_weights_are_offsets_from_one() {
        let w = WeightHandle::new("n", vec![2], vec![0.0, 1.0]);
        let out = RmsNorm::new(&w, 0.0, 1.0).forward(&[3.0, 3.0]);
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] - 2.0).abs() < 1e-6);
    }
}
