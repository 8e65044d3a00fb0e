use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Below this temperature decoding is greedy.
pub const GREEDY_TEMPERATURE: f32 = 1e-5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("temperature must be finite and non-negative, got {0}")]
    InvalidTemperature(f32),

    #[error("top_p must be in (0, 1], got {0}")]
    InvalidTopP(f32),

    #[error("repetition penalty must be finite and positive, got {0}")]
    InvalidPenalty(f32),

    #[error("no logits to sample from")]
    EmptyLogits,

    #[error("every logit is NaN or infinite")]
    NonFiniteLogits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens; 0 disables the cut.
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    /// How many of the most recent tokens the penalty looks at.
    pub repetition_window: usize,
    pub seed: Option<u64>,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repetition_penalty: 1.1,
            repetition_window: 64,
            seed: None,
        }
    }
}

impl SamplingPolicy {
    /// Arg-max decoding without a repetition penalty.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < GREEDY_TEMPERATURE
    }

    pub fn validate(&self) -> Result<(), SamplingError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidTemperature(self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SamplingError::InvalidTopP(self.top_p));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            return Err(SamplingError::InvalidPenalty(self.repetition_penalty));
        }
        Ok(())
    }
}

/// Session-scoped sampler: a validated policy plus its own RNG.
#[derive(Debug, Clone)]
pub struct Sampler {
    policy: SamplingPolicy,
    rng: StdRng,
}

impl Sampler {
    pub fn new(policy: SamplingPolicy) -> Result<Self, SamplingError> {
        policy.validate()?;
        let rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { policy, rng })
    }

    pub fn policy(&self) -> &SamplingPolicy {
        &self.policy
    }

    /// Pick the next token. `history` is every token seen so far in the session.
    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> Result<u32, SamplingError> {
        if logits.is_empty() {
            return Err(SamplingError::EmptyLogits);
        }
        if !logits.iter().any(|l| l.is_finite()) {
            return Err(SamplingError::NonFiniteLogits);
        }

        let mut logits = logits.to_vec();
        let window = history.len().saturating_sub(self.policy.repetition_window);
        apply_repetition_penalty(&mut logits, &history[window..], self.policy.repetition_penalty);

        if self.policy.is_greedy() {
            return argmax(&logits).ok_or(SamplingError::NonFiniteLogits);
        }

        let temperature = f64::from(self.policy.temperature);
        let mut candidates: Vec<(u32, f64)> = logits
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(id, l)| (id as u32, f64::from(*l) / temperature))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        if self.policy.top_k > 0 {
            candidates.truncate(self.policy.top_k);
        }

        let max = candidates[0].1;
        let mut probs: Vec<f64> = candidates.iter().map(|(_, l)| (l - max).exp()).collect();
        let total: f64 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= total);

        let top_p = f64::from(self.policy.top_p);
        if top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= top_p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
        }

        // WeightedIndex normalizes, so the truncated prefix needs no rescaling.
        let dist = WeightedIndex::new(&probs).map_err(|_| SamplingError::NonFiniteLogits)?;
        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}

/// Divide positive logits (multiply negative ones) of each distinct recent token.
pub fn apply_repetition_penalty(logits: &mut [f32], recent: &[u32], penalty: f32) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    let seen: HashSet<u32> = recent.iter().copied().collect();
    for id in seen {
        if let Some(l) = logits.get_mut(id as usize) {
            *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
        }
    }
}

/// Index of the largest finite logit, lowest id on ties.
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &l) in logits.iter().enumerate() {
        if !l.is_finite() {
            continue;
        }
        if best.map_or(true, |(_, b)| l > b) {
            best = Some((i, l));
        }
    }
    best.map(|(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(policy: SamplingPolicy) -> Sampler {
        Sampler::new(SamplingPolicy {
            seed: Some(7),
            ..policy
        })
        .unwrap()
    }

    #[test]
    fn defaults_match_chat_settings() {
        let p = SamplingPolicy::default();
        assert_eq!((p.temperature, p.top_k, p.top_p), (0.7, 40, 0.9));
        assert_eq!((p.repetition_penalty, p.repetition_window), (1.1, 64));
    }

    #[test]
    fn greedy_breaks_ties_towards_lowest_id() {
        let mut s = seeded(SamplingPolicy::greedy());
        assert_eq!(s.sample(&[0.1, 2.0, 2.0, -1.0], &[]).unwrap(), 1);
        assert_eq!(s.sample(&[f32::NAN, -3.0, f32::NEG_INFINITY], &[]).unwrap(), 1);
    }

    #[test]
    fn penalty_applies_once_per_distinct_token() {
        let mut logits = [2.0, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 0, 1, 1, 1, 9], 2.0);
        assert_eq!(logits, [1.0, -4.0, 1.0]);
    }

    #[test]
    fn penalty_can_change_the_greedy_choice() {
        let mut s = seeded(SamplingPolicy {
            repetition_penalty: 2.0,
            ..SamplingPolicy::greedy()
        });
        assert_eq!(s.sample(&[3.0, 2.0], &[5, 0]).unwrap(), 1);
    }

    #[test]
    fn penalty_only_sees_the_recent_window() {
        let mut s = seeded(SamplingPolicy {
            repetition_penalty: 2.0,
            repetition_window: 1,
            ..SamplingPolicy::greedy()
        });
        assert_eq!(s.sample(&[3.0, 2.0], &[0, 1]).unwrap(), 0);
    }

    #[test]
    fn top_k_of_one_is_arg_max() {
        let mut s = seeded(SamplingPolicy {
            temperature: 5.0,
            top_k: 1,
            top_p: 1.0,
            ..SamplingPolicy::default()
        });
        for _ in 0..20 {
            assert_eq!(s.sample(&[0.0, 0.5, 0.4], &[]).unwrap(), 1);
        }
    }

    #[test]
    fn tiny_top_p_keeps_only_the_best_candidate() {
        let mut s = seeded(SamplingPolicy {
            temperature: 1.0,
            top_k: 0,
            top_p: 1e-6,
            repetition_penalty: 1.0,
            ..SamplingPolicy::default()
        });
        for _ in 0..20 {
            assert_eq!(s.sample(&[1.0, 1.5, 0.2, 1.49], &[]).unwrap(), 1);
        }
    }

    #[test]
    fn same_seed_same_draws() {
        let policy = SamplingPolicy {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            ..SamplingPolicy::default()
        };
        let logits: Vec<f32> = (0..50).map(|i| (i % 7) as f32 * 0.3).collect();
        let mut a = seeded(policy.clone());
        let mut b = seeded(policy);
        let draws_a: Vec<u32> = (0..32).map(|_| a.sample(&logits, &[]).unwrap()).collect();
        let draws_b: Vec<u32> = (0..32).map(|_| b.sample(&logits, &[]).unwrap()).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn draws_follow_the_softmax() {
        let mut s = seeded(SamplingPolicy {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            ..SamplingPolicy::default()
        });
        let logits = [0.0, 3f32.ln()];
        let ones = (0..4000).filter(|_| s.sample(&logits, &[]).unwrap() == 1).count();
        let share = ones as f64 / 4000.0;
        assert!((share - 0.75).abs() < 0.04, "share {share}");
    }

    #[test]
    fn invalid_policies_are_rejected() {
        for (policy, err) in [
            (
                SamplingPolicy { temperature: -1.0, ..Default::default() },
                SamplingError::InvalidTemperature(-1.0),
            ),
            (
                SamplingPolicy { top_p: 0.0, ..Default::default() },
                SamplingError::InvalidTopP(0.0),
            ),
            (
                SamplingPolicy { top_p: 1.5, ..Default::default() },
                SamplingError::InvalidTopP(1.5),
            ),
            (
                SamplingPolicy { repetition_penalty: 0.0, ..Default::default() },
                SamplingError::InvalidPenalty(0.0),
            ),
        ] {
            assert_eq!(Sampler::new(policy).err(), Some(err));
        }
    }

    #[test]
    fn unusable_logits_are_errors() {
        let mut s = seeded(SamplingPolicy::default());
        assert_eq!(s.sample(&[], &[]), Err(SamplingError::EmptyLogits));
        assert_eq!(
            s.sample(&[f32::NAN, f32::INFINITY], &[]),
            Err(SamplingError::NonFiniteLogits)
        );
    }
}
