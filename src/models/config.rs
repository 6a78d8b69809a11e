//! Model and training configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::encoder::EncoderKind;
use super::projector::ProjectorKind;
use super::vocab::VocabConfig;

/// Top-level speech-to-speech model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Language model backbone
    #[serde(default)]
    pub llm: BackboneConfig,

    /// Shared vocabulary layout
    #[serde(default)]
    pub vocab_config: VocabConfig,

    /// Audio encoder variant
    #[serde(default)]
    pub encoder_name: EncoderKind,

    /// Feature dimension produced by the audio encoder
    #[serde(default = "default_encoder_dim")]
    pub encoder_dim: usize,

    /// Encoder-to-LM projector variant
    #[serde(default)]
    pub encoder_projector: ProjectorKind,

    /// Temporal downsampling rate of the projector
    #[serde(default = "default_encoder_projector_ds_rate")]
    pub encoder_projector_ds_rate: usize,

    /// Whether a codec decoder is attached for waveform output
    #[serde(default)]
    pub codec_decode: bool,
}

/// Decoder-only backbone configuration (Qwen2 layout)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Native vocabulary size of the pretrained checkpoint
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Hidden dimension
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Intermediate size in MLP
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Number of transformer layers
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Maximum sequence length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// RoPE theta base
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// Bias on the q/k/v projections
    #[serde(default = "default_attention_bias")]
    pub attention_bias: bool,

    /// Standard deviation for rows added when the vocabulary grows
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,

    /// Output projection shares the input embedding table
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
}

/// Training-time switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Freeze everything except the newly added output-projection rows
    #[serde(default)]
    pub train_audio_embed_only: bool,

    /// Keep the audio encoder out of the gradient graph
    #[serde(default = "default_true")]
    pub freeze_encoder: bool,

    /// Compute per-stream token accuracy in `forward`
    #[serde(default = "default_true")]
    pub compute_metrics: bool,
}

// Default values matching Qwen2-0.5B with the SNAC 7-layer layout
fn default_vocab_size() -> usize {
    151936
}

fn default_hidden_size() -> usize {
    896
}

fn default_intermediate_size() -> usize {
    4864
}

fn default_num_hidden_layers() -> usize {
    24
}

fn default_num_attention_heads() -> usize {
    14
}

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_rope_theta() -> f64 {
    1000000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_attention_bias() -> bool {
    true
}

fn default_initializer_range() -> f64 {
    0.02
}

fn default_encoder_dim() -> usize {
    1280
}

fn default_encoder_projector_ds_rate() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            num_key_value_heads: Some(2),
            max_position_embeddings: default_max_position_embeddings(),
            rope_theta: default_rope_theta(),
            rms_norm_eps: default_rms_norm_eps(),
            attention_bias: default_attention_bias(),
            initializer_range: default_initializer_range(),
            tie_word_embeddings: true,
        }
    }
}

impl BackboneConfig {
    /// Get number of key-value heads, defaulting to num_attention_heads if not set
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            llm: BackboneConfig::default(),
            vocab_config: VocabConfig::default(),
            encoder_name: EncoderKind::default(),
            encoder_dim: default_encoder_dim(),
            encoder_projector: ProjectorKind::default(),
            encoder_projector_ds_rate: default_encoder_projector_ds_rate(),
            codec_decode: false,
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_audio_embed_only: false,
            freeze_encoder: true,
            compute_metrics: true,
        }
    }
}

impl ModelConfig {
    /// Load configuration from a local model directory containing `config.json`
    pub fn from_pretrained(model_dir: &str) -> Result<Self> {
        let config_path = Path::new(model_dir).join("config.json");
        if config_path.exists() {
            return Self::from_file(&config_path);
        }

        anyhow::bail!(
            "No config.json found in {}; download the model locally first",
            model_dir
        )
    }

    /// Load configuration from a local JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Whether the output projection must grow to hold the audio vocabulary
    pub fn needs_resize(&self) -> bool {
        self.vocab_config.total_vocabsize() != self.llm.vocab_size
    }
}
