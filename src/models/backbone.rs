//! Qwen2-style decoder-only backbone
//!
//! A reference implementation of [`CausalLm`] so the crate runs end to end.
//! The multi-stream core only talks to the trait.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear_b, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use super::config::BackboneConfig;
use super::lm::CausalLm;

/// Parameter name of the shared input embedding table
pub const EMBED_TOKENS_KEY: &str = "model.embed_tokens.weight";

/// Parameter name of the output projection
pub const LM_HEAD_KEY: &str = "lm_head.weight";

/// Parameter holding the output projection: the embedding table when tied
pub fn output_projection_key(config: &BackboneConfig) -> &'static str {
    if config.tie_word_embeddings {
        EMBED_TOKENS_KEY
    } else {
        LM_HEAD_KEY
    }
}

/// Rotary position embedding
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, max_seq_len: usize, theta: f64, dtype: DType, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / (theta as f32).powf(i as f32 / dim as f32))
            .collect();

        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.unsqueeze(1)?;

        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?;
        let cos = freqs.cos()?.to_dtype(dtype)?;
        let sin = freqs.sin()?.to_dtype(dtype)?;

        Ok(Self { cos, sin })
    }

    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.i(offset..offset + seq_len)?;
        let sin = self.sin.i(offset..offset + seq_len)?;

        let q_rot = Self::rotate(q, &cos, &sin)?;
        let k_rot = Self::rotate(k, &cos, &sin)?;

        Ok((q_rot, k_rot))
    }

    fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let d = x.dim(D::Minus1)?;
        let x1 = x.narrow(D::Minus1, 0, d / 2)?;
        let x2 = x.narrow(D::Minus1, d / 2, d / 2)?;

        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

        let rotated = Tensor::cat(
            &[
                &(x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?,
                &(x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?,
            ],
            D::Minus1,
        )?;

        Ok(rotated)
    }
}

/// Multi-head attention with grouped-query attention support
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let bias = config.attention_bias;

        let q_proj = linear_b(hidden_size, num_heads * head_dim, bias, vb.pp("q_proj"))?;
        let k_proj = linear_b(hidden_size, num_kv_heads * head_dim, bias, vb.pp("k_proj"))?;
        let v_proj = linear_b(hidden_size, num_kv_heads * head_dim, bias, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        attention_mask: Option<&Tensor>,
        kv_cache: Option<&mut KVCache>,
        offset: usize,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // [batch, heads, seq, head_dim]
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rope.apply(&q, &k, offset)?;

        let (k, v) = if let Some(cache) = kv_cache {
            let k = cache.update_k(&k)?;
            let v = cache.update_v(&v)?;
            (k, v)
        } else {
            (k, v)
        };

        let k = self.repeat_kv(&k)?;
        let v = self.repeat_kv(&v)?;

        let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;

        let attn_weights = if let Some(mask) = attention_mask {
            attn_weights.broadcast_add(mask)?
        } else {
            attn_weights
        };

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v.contiguous()?)?;

        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        Ok(self.o_proj.forward(&attn_output)?)
    }

    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }

        let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
        let x = x
            .unsqueeze(2)?
            .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?;
        Ok(x)
    }
}

/// MLP block with SwiGLU activation
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Transformer decoder layer
pub struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            input_layernorm: rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        attention_mask: Option<&Tensor>,
        kv_cache: Option<&mut KVCache>,
        offset: usize,
    ) -> Result<Tensor> {
        let residual = hidden_states;
        let hidden_states = self.input_layernorm.forward(hidden_states)?;
        let hidden_states = self
            .self_attn
            .forward(&hidden_states, rope, attention_mask, kv_cache, offset)?;
        let hidden_states = (residual + hidden_states)?;

        let residual = &hidden_states;
        let hidden_states = self.post_attention_layernorm.forward(&hidden_states)?;
        let hidden_states = self.mlp.forward(&hidden_states)?;
        Ok((residual + hidden_states)?)
    }
}

/// Per-layer KV cache
#[derive(Default)]
pub struct KVCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self { k: None, v: None }
    }

    pub fn update_k(&mut self, k: &Tensor) -> Result<Tensor> {
        let k = if let Some(prev_k) = &self.k {
            Tensor::cat(&[prev_k, k], 2)?
        } else {
            k.clone()
        };
        self.k = Some(k.clone());
        Ok(k)
    }

    pub fn update_v(&mut self, v: &Tensor) -> Result<Tensor> {
        let v = if let Some(prev_v) = &self.v {
            Tensor::cat(&[prev_v, v], 2)?
        } else {
            v.clone()
        };
        self.v = Some(v.clone());
        Ok(v)
    }
}

/// Decode state of the whole backbone: one KV cache per layer plus the
/// number of positions already consumed
pub struct BackboneCache {
    layers: Vec<KVCache>,
    offset: usize,
}

impl BackboneCache {
    /// Positions held in the cache
    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }
}

/// Qwen2-style language model over the shared vocabulary
pub struct QwenBackbone {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    config: BackboneConfig,
    vocab_size: usize,
    dtype: DType,
    device: Device,
}

impl QwenBackbone {
    /// Build the backbone with an embedding table and output projection of
    /// `vocab_size` rows
    ///
    /// With `tie_word_embeddings` the projection reuses the embedding tensor,
    /// so both see the same gradient.
    pub fn new(config: BackboneConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let embed_tokens = embedding(vocab_size, config.hidden_size, vb.pp("model.embed_tokens"))?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::new(&config, vb.pp(format!("model.layers.{}", i)))?);
        }

        let norm = rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, vocab_size, vb.pp("lm_head"))?
        };

        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            dtype,
            &device,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            config,
            vocab_size,
            dtype,
            device,
        })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    fn run_layers(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: Option<&Tensor>,
        mut cache: Option<&mut BackboneCache>,
    ) -> Result<Tensor> {
        let seq_len = inputs_embeds.dim(1)?;
        let offset = cache.as_ref().map(|c| c.offset).unwrap_or(0);
        let mask = self.create_attention_mask(seq_len, offset, attention_mask)?;

        let mut hidden_states = inputs_embeds.to_dtype(self.dtype)?;
        for (i, layer) in self.layers.iter().enumerate() {
            let kv_cache = cache.as_deref_mut().map(|c| &mut c.layers[i]);
            hidden_states = layer.forward(&hidden_states, &self.rope, Some(&mask), kv_cache, offset)?;
        }
        if let Some(cache) = cache {
            cache.offset += seq_len;
        }

        let hidden_states = self.norm.forward(&hidden_states)?;
        Ok(self.lm_head.forward(&hidden_states)?)
    }

    /// Additive mask `[batch | 1, 1, seq_len, offset + seq_len]`: causal, plus a
    /// large negative bias on padded key positions
    fn create_attention_mask(
        &self,
        seq_len: usize,
        offset: usize,
        padding: Option<&Tensor>,
    ) -> Result<Tensor> {
        let total_len = offset + seq_len;
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..total_len).map(move |j| if j <= offset + i { 0.0 } else { f32::NEG_INFINITY })
            })
            .collect();
        let causal = Tensor::new(mask.as_slice(), &self.device)?.reshape((1, 1, seq_len, total_len))?;

        let mask = match padding {
            Some(padding) => {
                let batch = padding.dim(0)?;
                let padding = padding
                    .to_dtype(DType::F32)?
                    .affine(1e9, -1e9)?
                    .reshape((batch, 1, 1, total_len))?;
                causal.broadcast_add(&padding)?
            }
            None => causal,
        };
        Ok(mask.to_dtype(self.dtype)?)
    }
}

impl CausalLm for QwenBackbone {
    type Cache = BackboneCache;

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(input_ids)?)
    }

    fn forward(&self, inputs_embeds: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        self.run_layers(inputs_embeds, attention_mask, None)
    }

    fn new_cache(&self) -> BackboneCache {
        BackboneCache {
            layers: (0..self.layers.len()).map(|_| KVCache::new()).collect(),
            offset: 0,
        }
    }

    fn step(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        cache: &mut BackboneCache,
    ) -> Result<Tensor> {
        self.run_layers(inputs_embeds, Some(attention_mask), Some(cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn small_config() -> BackboneConfig {
        BackboneConfig {
            vocab_size: 64,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 128,
            rope_theta: 10000.0,
            ..Default::default()
        }
    }

    fn build_with(config: BackboneConfig, device: &Device) -> (VarMap, QwenBackbone) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = QwenBackbone::new(config, 80, vb).unwrap();
        (varmap, model)
    }

    fn build(device: &Device) -> (VarMap, QwenBackbone) {
        build_with(small_config(), device)
    }

    #[test]
    fn test_backbone_construction() {
        let device = Device::Cpu;
        let (varmap, model) = build(&device);
        assert_eq!(model.vocab_size(), 80);
        assert_eq!(model.hidden_size(), 32);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data.get(EMBED_TOKENS_KEY).unwrap().dims(), &[80, 32]);
        assert!(data.get(LM_HEAD_KEY).is_none());
        assert_eq!(output_projection_key(model.config()), EMBED_TOKENS_KEY);
    }

    #[test]
    fn test_untied_backbone_has_own_head() {
        let device = Device::Cpu;
        let config = BackboneConfig {
            tie_word_embeddings: false,
            ..small_config()
        };
        let (varmap, model) = build_with(config, &device);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data.get(LM_HEAD_KEY).unwrap().dims(), &[80, 32]);
        assert_eq!(output_projection_key(model.config()), LM_HEAD_KEY);
    }

    #[test]
    fn test_tied_head_shares_embedding_gradient() {
        let device = Device::Cpu;
        let (varmap, model) = build(&device);
        let embed = varmap.data().lock().unwrap().get(EMBED_TOKENS_KEY).unwrap().clone();

        // Gradient reaches the table through the output projection alone
        let embeds = Tensor::randn(0f32, 1.0, (1, 3, 32), &device).unwrap();
        let loss = model.forward(&embeds, None).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(embed.as_tensor()).unwrap();
        let norm = grad.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(norm > 0.0);
    }

    #[test]
    fn test_forward_shape() {
        let device = Device::Cpu;
        let (_varmap, model) = build(&device);
        let embeds = Tensor::randn(0f32, 1.0, (2, 5, 32), &device).unwrap();
        let logits = model.forward(&embeds, None).unwrap();
        assert_eq!(logits.dims(), &[2, 5, 80]);
    }

    #[test]
    fn test_cached_steps_match_full_forward() {
        let device = Device::Cpu;
        let (_varmap, model) = build(&device);
        let embeds = Tensor::randn(0f32, 1.0, (1, 4, 32), &device).unwrap();
        let full = model.forward(&embeds, None).unwrap();

        let mut cache = model.new_cache();
        let prefix_mask = Tensor::ones((1, 3), DType::U8, &device).unwrap();
        model
            .step(&embeds.narrow(1, 0, 3).unwrap(), &prefix_mask, &mut cache)
            .unwrap();
        assert_eq!(cache.len(), 3);

        let mask = Tensor::ones((1, 4), DType::U8, &device).unwrap();
        let last = model
            .step(&embeds.narrow(1, 3, 1).unwrap(), &mask, &mut cache)
            .unwrap();
        assert_eq!(cache.len(), 4);

        let expected: Vec<f32> = full.i((0, 3)).unwrap().to_vec1().unwrap();
        let actual: Vec<f32> = last.i((0, 0)).unwrap().to_vec1().unwrap();
        for (e, a) in expected.iter().zip(actual.iter()) {
            assert!((e - a).abs() < 1e-4, "{e} vs {a}");
        }
    }

    #[test]
    fn test_kv_cache_grows_along_sequence() {
        let device = Device::Cpu;
        let mut cache = KVCache::new();
        let k = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        let grown = cache.update_k(&k).unwrap();
        let grown = cache.update_k(&grown.narrow(2, 0, 1).unwrap()).unwrap();
        assert_eq!(grown.dim(2).unwrap(), 4);
        assert!(cache.v.is_none());
    }
}
