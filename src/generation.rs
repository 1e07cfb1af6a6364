// src/generation.rs

use log::{debug, warn};
use std::time::{Duration, Instant};

use crate::config::GenerationSettings;
use crate::error::{Error, Result};
use crate::llama::LlamaModel;
use crate::sampling::Sampler;
use crate::tokenizer::TokenizerWrapper;

pub const INSTRUCTION_END: &str = "[/INST]";
pub const PREVIEW_CHARS: usize = 300;

pub const SAMPLE_INGREDIENTS: [&str; 2] = ["eggs, onions", "tomatoes, pasta"];

/// Chat prompt asking for a recipe built from `ingredients`.
pub fn prompt_for(ingredients: &str) -> String {
    format!(
        "<s>[INST] Suggest a recipe using the following ingredients:\n{} {}",
        ingredients, INSTRUCTION_END
    )
}

/// The text after the first `[/INST]`, trimmed; the whole text when the
/// marker is absent.
pub fn extract_response(decoded: &str) -> &str {
    match decoded.split_once(INSTRUCTION_END) {
        Some((_, response)) => response.trim(),
        None => decoded,
    }
}

/// First `max_chars` characters, with `...` appended when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Prompt followed by the generated tokens.
    pub token_ids: Vec<u32>,
    pub prompt_len: usize,
    pub elapsed: Duration,
    pub stopped_at_eos: bool,
}

impl GenerationOutput {
    pub fn new_tokens(&self) -> &[u32] {
        &self.token_ids[self.prompt_len..]
    }
}

/// Autoregressive decoding: one forward pass over the prompt, then one per
/// new token against the KV cache. Stops at EOS, at `max_new_tokens`, or
/// when the model's context is full. The EOS token is kept in the output.
pub fn generate(
    model: &LlamaModel,
    prompt_ids: &[u32],
    settings: &GenerationSettings,
    eos_token_ids: Vec<u32>,
) -> Result<GenerationOutput> {
    if prompt_ids.is_empty() {
        return Err(Error::Generation("prompt encodes to zero tokens".to_string()));
    }
    settings.validate()?;

    let start = Instant::now();
    let max_positions = model.config().max_position_embeddings;
    let mut sampler = Sampler::new(settings, eos_token_ids);
    let mut cache = model.new_cache();
    let mut token_ids = prompt_ids.to_vec();
    let mut stopped_at_eos = false;

    let mut logits = model.forward(prompt_ids, &mut cache)?;
    for generated in 0..settings.max_new_tokens {
        let next = sampler.next_token(&mut logits, &token_ids, generated)?;
        token_ids.push(next);

        if sampler.is_eos(next) {
            stopped_at_eos = true;
            break;
        }
        if generated + 1 == settings.max_new_tokens {
            break;
        }
        if cache.seq_len() >= max_positions {
            warn!(
                "context window of {} positions is full, stopping after {} new tokens",
                max_positions,
                generated + 1
            );
            break;
        }
        logits = model.forward(&[next], &mut cache)?;
    }

    let output = GenerationOutput {
        prompt_len: prompt_ids.len(),
        token_ids,
        elapsed: start.elapsed(),
        stopped_at_eos,
    };
    debug!(
        "generated {} tokens in {:.2?} (eos: {})",
        output.new_tokens().len(),
        output.elapsed,
        output.stopped_at_eos
    );
    Ok(output)
}

#[derive(Debug, Clone)]
pub struct RecipeSample {
    pub ingredients: String,
    pub response: String,
    pub new_tokens: usize,
    pub elapsed: Duration,
}

/// Prompts the model for a recipe and decodes its answer.
pub fn suggest_recipe(
    model: &LlamaModel,
    tokenizer: &TokenizerWrapper,
    ingredients: &str,
    settings: &GenerationSettings,
    eos_token_ids: Vec<u32>,
) -> Result<RecipeSample> {
    let prompt_ids = tokenizer.encode(&prompt_for(ingredients), true)?;
    let output = generate(model, &prompt_ids, settings, eos_token_ids)?;
    let decoded = tokenizer.decode(&output.token_ids, true)?;
    Ok(RecipeSample {
        ingredients: ingredients.to_string(),
        response: extract_response(&decoded).to_string(),
        new_tokens: output.new_tokens().len(),
        elapsed: output.elapsed,
    })
}
