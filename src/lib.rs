//! # slam-s2s
//!
//! Training forward pass and parallel decoding loop for speech-to-speech
//! language models that predict one text stream and seven audio-codec
//! streams at every step.
//!
//! ## Features
//!
//! - **CPU**: Default, with optional MKL/Accelerate for faster BLAS
//! - **CUDA**: NVIDIA GPU acceleration
//! - **Metal**: Apple Silicon GPU acceleration
//!
//! ## Example
//!
//! ```rust,ignore
//! use slam_s2s::{load_qwen_s2s, GenerationConfig, ModelConfig, S2SBatch, S2SComponents, TrainConfig};
//!
//! let device = slam_s2s::auto_device()?;
//! let config = ModelConfig::from_pretrained("models/slam-omni")?;
//! let loaded = load_qwen_s2s(config, TrainConfig::default(), Some(weights), S2SComponents::default(), DType::F32, &device)?;
//! let prompt = S2SBatch::text_prompt(loaded.model.vocab(), &text_ids, &device)?;
//! let streams = loaded.model.generate(&prompt, &GenerationConfig::default())?;
//! ```

pub mod generation;
pub mod models;
pub mod tokenizer;
pub mod training;

use anyhow::Result;
use candle_core::Device;

/// Re-exports for convenience
pub use generation::{GeneratedStreams, GenerationConfig};
pub use models::{
    load_qwen_s2s, CausalLm, ModelConfig, S2SBatch, S2SComponents, SlamS2S, TrainConfig,
    VocabConfig,
};
pub use tokenizer::TextTokenizer;

/// Select the best available device
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string: `auto`, `cpu`, `cuda`, `cuda:N` or `metal`
pub fn parse_device(name: &str) -> Result<Device> {
    match name {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        "metal" => Ok(Device::new_metal(0)?),
        "cuda" => Ok(Device::new_cuda(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(index) => {
                let index: usize = index
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid CUDA device index: {}", index))?;
                Ok(Device::new_cuda(index)?)
            }
            None => anyhow::bail!("Unknown device '{}'; expected auto, cpu, cuda, cuda:N or metal", other),
        },
    }
}

/// Short human-readable device description
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
