use std::path::Path;
use tokenizers::Tokenizer; // From the 'tokenizers' crate

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
}

impl TokenizerWrapper {
    pub fn new(tokenizer_path: &Path) -> Result<Self> {
        let tokenizer_instance = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            Error::Tokenizer(format!(
                "Failed to load tokenizer from {:?}: {}",
                tokenizer_path, e
            ))
        })?;
        Ok(Self {
            tokenizer: tokenizer_instance,
        })
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Tokenizer(format!("Encoding failed for text '{}': {}", text, e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenizer(format!("Decoding failed for {} ids: {}", ids.len(), e)))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Distinct tokens, added tokens included.
    pub fn get_vocab_size(&self) -> usize {
        self.tokenizer.get_vocab(true).len()
    }
}
