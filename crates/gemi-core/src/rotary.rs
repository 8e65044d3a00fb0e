/// Rotary position encoding with rotate-half pairing: element `i` of a head is
/// rotated together with element `i + head_dim / 2`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f64>,
    head_dim: usize,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64) -> Self {
        let inv_freq = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64))
            .collect();
        Self { inv_freq, head_dim }
    }

    /// Rotate every head in `x` (laid out `[head][head_dim]`) to `position`.
    pub fn apply(&self, x: &mut [f32], position: usize) {
        let half = self.head_dim / 2;
        for head in x.chunks_exact_mut(self.head_dim) {
            for (i, freq) in self.inv_freq.iter().enumerate() {
                let (sin, cos) = (position as f64 * freq).sin_cos();
                let (sin, cos) = (sin as f32, cos as f32);
                let (a, b) = (head[i], head[i + half]);
                head[i] = a * cos - b * sin;
                head[i + half] = b * cos + a * sin;
            }
        }
    }
}
