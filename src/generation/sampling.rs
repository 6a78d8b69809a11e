//! Per-stream token selection for parallel decoding

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Configuration for autoregressive generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sample from the softmax instead of taking the arg-max
    #[serde(default)]
    pub do_sample: bool,
    /// Maximum number of decode steps
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Sampling temperature (1.0 = no change, <1.0 = more focused, >1.0 = more random)
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Repetition penalty (1.0 = no penalty)
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,
    /// Seed for the sampling RNG; drawn from the OS when unset
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_new_tokens() -> usize {
    360
}

fn default_temperature() -> f64 {
    1.0
}

fn default_repetition_penalty() -> f64 {
    1.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            do_sample: false,
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            repetition_penalty: default_repetition_penalty(),
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Load options from a JSON file; unknown keys are ignored
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read generation config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse generation config from {}", path.display()))
    }

    /// Whether token selection draws from the distribution
    pub fn samples(&self) -> bool {
        self.do_sample && self.temperature > 0.0
    }
}

/// Token selector holding the RNG for one generation call
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    /// Pick one id from `logits` of shape `[vocab]`
    ///
    /// Greedy unless sampling is enabled with a positive temperature.
    pub fn sample(&mut self, logits: &Tensor, config: &GenerationConfig) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        if !config.samples() {
            return greedy_sample(&logits);
        }

        let logits = if config.temperature != 1.0 {
            (logits / config.temperature)?
        } else {
            logits
        };
        let probs = candle_nn::ops::softmax_last_dim(&logits)?;
        self.sample_multinomial(&probs)
    }

    /// Draw one index by walking the CDF of `probs`
    fn sample_multinomial(&mut self, probs: &Tensor) -> Result<u32> {
        let probs: Vec<f32> = probs.to_device(&Device::Cpu)?.flatten_all()?.to_vec1()?;

        let sample: f64 = self.rng.random();
        let mut cumulative = 0.0f64;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p as f64;
            if sample < cumulative {
                return Ok(i as u32);
            }
        }
        // Floating-point rounding can leave the total just under 1
        Ok(probs.len().saturating_sub(1) as u32)
    }
}

/// Apply a sign-aware repetition penalty to the ids seen in `history`
///
/// Positive logits are divided by `penalty`, the rest multiplied, so a
/// penalty above 1 always makes a repeated id less likely. Each distinct id
/// is penalised once.
pub fn apply_repetition_penalty(logits: &Tensor, history: &[u32], penalty: f64) -> Result<Tensor> {
    if (penalty - 1.0).abs() < 1e-9 || history.is_empty() {
        return Ok(logits.clone());
    }

    let shape = logits.shape().clone();
    let dtype = logits.dtype();
    let mut values: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let vocab = values.len();

    let seen: HashSet<u32> = history.iter().copied().collect();
    for token_id in seen {
        let idx = token_id as usize;
        if idx < vocab {
            if values[idx] < 0.0 {
                values[idx] *= penalty as f32;
            } else {
                values[idx] /= penalty as f32;
            }
        }
    }

    Ok(Tensor::new(values.as_slice(), logits.device())?
        .reshape(shape)?
        .to_dtype(dtype)?)
}

/// Greedy sampling (argmax over the last dimension)
pub fn greedy_sample(logits: &Tensor) -> Result<u32> {
    Ok(logits.flatten_all()?.argmax(D::Minus1)?.to_scalar::<u32>()?)
}
