//! Interface to the autoregressive language model
//!
//! The multi-stream core never looks inside the transformer. It needs the
//! shared embedding table, a full-sequence forward for training and a cached
//! single-step call for decoding.

use anyhow::Result;
use candle_core::Tensor;

/// Decoder-only language model over the shared text + audio vocabulary
pub trait CausalLm {
    /// Incremental decode state carried between [`CausalLm::step`] calls
    type Cache;

    /// Width of the output projection
    fn vocab_size(&self) -> usize;

    /// Embedding dimension
    fn hidden_size(&self) -> usize;

    /// Look up token ids of any shape `[..]` and return `[.., hidden]`
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Full-sequence forward used in training
    ///
    /// `inputs_embeds` is `[batch, seq, hidden]`, `attention_mask` is an
    /// optional `[batch, seq]` padding mask (1 = attend). Returns logits
    /// `[batch, seq, vocab]`.
    fn forward(&self, inputs_embeds: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor>;

    /// Fresh, empty decode state
    fn new_cache(&self) -> Self::Cache;

    /// Score the next positions given new embeddings and the carried cache
    ///
    /// `inputs_embeds` is `[batch, new_len, hidden]`; `attention_mask` covers
    /// every position seen so far, `[batch, cached_len + new_len]`. The cache is
    /// updated in place. Returns logits `[batch, new_len, vocab]`.
    fn step(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        cache: &mut Self::Cache,
    ) -> Result<Tensor>;
}
