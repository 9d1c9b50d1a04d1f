//! Token sampling shared by the in-process backends.

use std::cmp::Ordering;
use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::types::SamplingParams;

const DEFAULT_SEED: u64 = 299_792_458;

pub struct Sampler {
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: &SamplingParams) -> Self {
        Self::with_seed(params, DEFAULT_SEED)
    }

    pub fn with_seed(params: &SamplingParams, seed: u64) -> Self {
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            repeat_penalty: params.repeat_penalty,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Picks the next token. A zero temperature means greedy decoding.
    pub fn sample(&mut self, logits: &mut [f32], context: &[u32]) -> u32 {
        apply_repeat_penalty(logits, self.repeat_penalty, context);

        if self.temperature <= f32::EPSILON {
            return argmax(logits);
        }

        let probs = softmax(logits, self.temperature);
        let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let mut cumulative = 0.0;
        let mut cutoff = ranked.len();
        for (position, (_, p)) in ranked.iter().enumerate() {
            cumulative += p;
            if cumulative >= self.top_p {
                cutoff = position + 1;
                break;
            }
        }
        ranked.truncate(cutoff.max(1));

        let total: f32 = ranked.iter().map(|(_, p)| p).sum();
        let mut draw = self.rng.random::<f32>() * total;
        for (token, p) in &ranked {
            if draw < *p {
                return *token as u32;
            }
            draw -= p;
        }
        ranked.last().map(|(token, _)| *token as u32).unwrap_or(0)
    }
}

/// Divides positive logits and multiplies negative ones for every token that
/// already appeared, discouraging repetition.
pub fn apply_repeat_penalty(logits: &mut [f32], penalty: f32, context: &[u32]) {
    if (penalty - 1.0).abs() <= f32::EPSILON {
        return;
    }
    let seen: HashSet<u32> = context.iter().copied().collect();
    for token in seen {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit >= 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx as u32)
        .unwrap_or(0)
}

fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0 / logits.len() as f32; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f32) -> SamplingParams {
        SamplingParams {
            max_tokens: 8,
            temperature,
            top_p: SamplingParams::TOP_P,
            repeat_penalty: SamplingParams::REPEAT_PENALTY,
        }
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let mut sampler = Sampler::new(&params(0.0));
        let mut logits = vec![0.1, 2.5, 0.3];
        assert_eq!(sampler.sample(&mut logits, &[]), 1);
    }

    #[test]
    fn repeat_penalty_can_change_the_winner() {
        let mut sampler = Sampler::new(&SamplingParams {
            repeat_penalty: 2.0,
            ..params(0.0)
        });
        let mut logits = vec![1.9, 1.0, -3.0];
        assert_eq!(sampler.sample(&mut logits, &[0]), 1);
    }

    #[test]
    fn penalty_pushes_negative_logits_further_down() {
        let mut logits = vec![-1.0, 1.0];
        apply_repeat_penalty(&mut logits, 1.5, &[0, 1, 1]);
        assert!((logits[0] + 1.5).abs() < 1e-6);
        assert!((logits[1] - 1.0 / 1.5).abs() < 1e-6);
    }

    #[test]
    fn nucleus_sampling_stays_inside_the_top_mass() {
        let mut sampler = Sampler::with_seed(&params(1.0), 7);
        for _ in 0..50 {
            let mut logits = vec![10.0, 9.5, -20.0, -20.0];
            let token = sampler.sample(&mut logits, &[]);
            assert!(token == 0 || token == 1);
        }
    }
}
