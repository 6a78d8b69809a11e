//! Text tokenizer wrapper for the backbone's Qwen2 tokenizer

use anyhow::{anyhow, Result};
use std::path::Path;
use tokenizers::Tokenizer;

use crate::models::vocab::VocabConfig;

/// Text tokenizer wrapping HuggingFace tokenizers
pub struct TextTokenizer {
    tokenizer: Tokenizer,
}

impl TextTokenizer {
    /// Load `tokenizer.json` from a local model directory
    pub fn from_pretrained(model_dir: &str) -> Result<Self> {
        let tokenizer_path = Path::new(model_dir).join("tokenizer.json");
        if tokenizer_path.exists() {
            return Self::from_file(&tokenizer_path);
        }

        Err(anyhow!(
            "No tokenizer.json found in {}; download the tokenizer locally first",
            model_dir
        ))
    }

    /// Load tokenizer from a local file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;

        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Parse a serialized `tokenizer.json`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_bytes(bytes).map_err(|e| anyhow!("Failed to parse tokenizer: {}", e))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    pub fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    /// Encode text to token IDs
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Failed to encode text: {}", e))?;

        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow!("Failed to decode tokens: {}", e))?;

        Ok(text)
    }

    /// Decode a generated text stream, dropping the layout's special ids
    /// (end-of-text, padding, task markers)
    pub fn decode_text_stream(&self, ids: &[u32], vocab: &VocabConfig) -> Result<String> {
        let limit = vocab.text_vocabsize as u32;
        let ids: Vec<u32> = ids.iter().copied().filter(|&id| id < limit).collect();
        self.decode(&ids)
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Convert token to ID
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }
}
