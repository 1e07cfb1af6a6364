// src/sampling.rs

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;

use crate::config::GenerationSettings;
use crate::error::{Error, Result};

/// Divides positive logits of already-seen tokens by `penalty` and
/// multiplies negative ones, once per distinct token.
pub fn apply_repetition_penalty(logits: &mut [f32], context: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<u32> = context.iter().copied().collect();
    for id in seen {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = if *logit < 0.0 { *logit * penalty } else { *logit / penalty };
        }
    }
}

pub fn suppress_tokens(logits: &mut [f32], ids: &[u32]) {
    for &id in ids {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if temperature != 1.0 {
        for logit in logits.iter_mut() {
            *logit /= temperature;
        }
    }
}

/// Masks everything below the `k`-th largest logit. Ties with it survive.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Keeps the most likely tokens whose cumulative probability first reaches
/// `top_p`; at least one token always survives.
pub fn top_p_filter(logits: &mut [f32], top_p: f32) {
    if top_p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0;
    let mut keep = 0;
    for &idx in &order {
        keep += 1;
        cumulative += probs[idx];
        if cumulative >= top_p {
            break;
        }
    }
    for &idx in &order[keep..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
}

pub struct Sampler {
    settings: GenerationSettings,
    eos_token_ids: Vec<u32>,
    rng: StdRng,
}

impl Sampler {
    pub fn new(settings: &GenerationSettings, eos_token_ids: Vec<u32>) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            settings: settings.clone(),
            eos_token_ids,
            rng,
        }
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }

    /// Picks the next token. `context` is every token so far, prompt
    /// included; `generated` counts the new ones.
    pub fn next_token(&mut self, logits: &mut [f32], context: &[u32], generated: usize) -> Result<u32> {
        apply_repetition_penalty(logits, context, self.settings.repetition_penalty);
        if generated < self.settings.min_new_tokens {
            suppress_tokens(logits, &self.eos_token_ids);
        }

        if !self.settings.do_sample {
            return argmax(logits)
                .map(|idx| idx as u32)
                .ok_or_else(|| Error::Generation("no logits to pick from".to_string()));
        }

        apply_temperature(logits, self.settings.temperature);
        if let Some(k) = self.settings.top_k {
            top_k_filter(logits, k);
        }
        top_p_filter(logits, self.settings.top_p);

        let probs = softmax(logits);
        let dist = WeightedIndex::new(&probs)
            .map_err(|e| Error::Generation(format!("cannot sample from logits: {}", e)))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}
