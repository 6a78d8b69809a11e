//! Audio encoder dispatch
//!
//! The encoder itself is an opaque [`FeatureExtractor`]. This module only knows
//! how each variant wants its input laid out and how its output comes back.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

/// Supported audio encoder variants, selected once at construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderKind {
    /// Whisper encoder over log-mel features
    #[default]
    Whisper,
    /// WavLM over raw waveform
    Wavlm,
    /// HuBERT pretrained checkpoint, batch-major output
    HubertPretrain,
    /// HuBERT fine-tuned checkpoint, time-major output
    HubertFinetune,
    /// No encoder: features are used as given
    None,
}

impl EncoderKind {
    /// Whether this variant needs a [`FeatureExtractor`] backend
    pub fn needs_backend(&self) -> bool {
        !matches!(self, EncoderKind::None)
    }
}

/// Raw audio inputs of one batch; any subset may be present
#[derive(Debug, Clone, Default)]
pub struct AudioFeatures {
    /// Log-mel spectrogram `[batch, n_mels, frames]`
    pub audio_mel: Option<Tensor>,
    /// Frame mask after the encoder's own downsampling `[batch, frames']`
    pub audio_mel_post_mask: Option<Tensor>,
    /// Raw waveform `[batch, samples]`
    pub audio: Option<Tensor>,
    /// Waveform validity mask `[batch, samples]`, 1 = real sample
    pub audio_mask: Option<Tensor>,
}

impl AudioFeatures {
    pub fn is_empty(&self) -> bool {
        self.audio_mel.is_none() && self.audio.is_none()
    }
}

/// Encoder features plus the padding mask that goes with them
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, frames, dim]`
    pub features: Tensor,
    pub padding_mask: Option<Tensor>,
}

/// Opaque audio feature extractor: features in, features + mask out
pub trait FeatureExtractor {
    fn extract(&self, input: &Tensor, padding_mask: Option<&Tensor>) -> Result<EncoderOutput>;
}

/// Audio encoder front-end
pub struct AudioEncoder {
    kind: EncoderKind,
    backend: Option<Box<dyn FeatureExtractor>>,
    freeze: bool,
}

impl AudioEncoder {
    /// `backend` is required for every variant except [`EncoderKind::None`].
    /// With `freeze` set the encoder output is detached from the graph.
    pub fn new(
        kind: EncoderKind,
        backend: Option<Box<dyn FeatureExtractor>>,
        freeze: bool,
    ) -> Result<Self> {
        anyhow::ensure!(
            backend.is_some() || !kind.needs_backend(),
            "encoder {:?} requires a feature extractor backend",
            kind
        );
        if backend.is_some() && !kind.needs_backend() {
            tracing::warn!("Ignoring feature extractor backend for encoder kind none");
        }
        let backend = if kind.needs_backend() { backend } else { None };

        Ok(Self {
            kind,
            backend,
            freeze,
        })
    }

    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    /// Run the encoder over whatever audio the batch carries
    ///
    /// Returns `None` when the batch has neither mel features nor waveform.
    pub fn encode(&self, inputs: &AudioFeatures) -> Result<Option<EncoderOutput>> {
        if inputs.is_empty() {
            return Ok(None);
        }

        let output = match (self.kind, self.backend.as_deref()) {
            (EncoderKind::None, _) | (_, None) => {
                let features = inputs
                    .audio_mel
                    .as_ref()
                    .or(inputs.audio.as_ref())
                    .context("no audio input")?;
                EncoderOutput {
                    features: features.clone(),
                    padding_mask: inputs.audio_mel_post_mask.clone(),
                }
            }
            (EncoderKind::Whisper, Some(backend)) => {
                let mel = inputs
                    .audio_mel
                    .as_ref()
                    .context("whisper encoder needs audio_mel")?;
                let output = backend.extract(&mel.transpose(1, 2)?.contiguous()?, None)?;
                EncoderOutput {
                    features: output.features,
                    padding_mask: inputs.audio_mel_post_mask.clone(),
                }
            }
            (EncoderKind::Wavlm, Some(backend)) => {
                let (audio, padding) = waveform_inputs(inputs)?;
                let output = backend.extract(audio, Some(&padding))?;
                EncoderOutput {
                    features: output.features,
                    padding_mask: inputs.audio_mel_post_mask.clone(),
                }
            }
            (EncoderKind::HubertPretrain, Some(backend)) => {
                let (audio, padding) = waveform_inputs(inputs)?;
                backend.extract(audio, Some(&padding))?
            }
            (EncoderKind::HubertFinetune, Some(backend)) => {
                let (audio, padding) = waveform_inputs(inputs)?;
                let output = backend.extract(audio, Some(&padding))?;
                EncoderOutput {
                    features: output.features.transpose(0, 1)?.contiguous()?,
                    padding_mask: output.padding_mask,
                }
            }
        };

        if self.freeze {
            return Ok(Some(EncoderOutput {
                features: output.features.detach(),
                padding_mask: output.padding_mask,
            }));
        }
        Ok(Some(output))
    }
}

/// Waveform plus its padding mask (1 = padded), as the SSL encoders expect
fn waveform_inputs(inputs: &AudioFeatures) -> Result<(&Tensor, Tensor)> {
    let audio = inputs.audio.as_ref().context("encoder needs a raw waveform")?;
    let audio_mask = inputs
        .audio_mask
        .as_ref()
        .context("encoder needs audio_mask")?;
    let padding = audio_mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?;
    Ok((audio, padding))
}
