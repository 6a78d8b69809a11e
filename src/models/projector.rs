//! Encoder-to-LM projectors
//!
//! Map encoder features `[batch, frames, encoder_dim]` to LM embeddings
//! `[batch, frames / k, hidden]`, downsampling time by `k`.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use super::config::ModelConfig;

const PROJECTOR_HIDDEN: usize = 2048;

/// Projector variants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectorKind {
    /// Frame concatenation followed by a two-layer MLP
    #[default]
    Linear,
    /// Strided convolution followed by a two-layer MLP
    #[serde(rename = "cov1d-linear")]
    Conv1dLinear,
    /// Cross-attention pooling, supplied from outside
    QFormer,
}

/// Anything that maps encoder features (and their padding mask) to LM embeddings
pub trait Projector {
    fn project(&self, features: &Tensor, padding_mask: Option<&Tensor>) -> Result<Tensor>;
}

/// Concatenate every `k` frames, then Linear -> ReLU -> Linear
pub struct LinearProjector {
    k: usize,
    linear1: Linear,
    linear2: Linear,
}

impl LinearProjector {
    pub fn new(encoder_dim: usize, llm_dim: usize, k: usize, vb: VarBuilder) -> Result<Self> {
        anyhow::ensure!(k > 0, "projector downsample rate must be positive");
        Ok(Self {
            k,
            linear1: linear(encoder_dim * k, PROJECTOR_HIDDEN, vb.pp("linear1"))?,
            linear2: linear(PROJECTOR_HIDDEN, llm_dim, vb.pp("linear2"))?,
        })
    }
}

impl Projector for LinearProjector {
    fn project(&self, features: &Tensor, _padding_mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, frames, dim) = features.dims3()?;
        // Trailing frames that do not fill a group are dropped
        let kept = frames - frames % self.k;
        let x = features
            .narrow(1, 0, kept)?
            .contiguous()?
            .reshape((batch, kept / self.k, dim * self.k))?;
        let x = self.linear1.forward(&x)?.relu()?;
        Ok(self.linear2.forward(&x)?)
    }
}

/// Conv1d(kernel k, stride k) -> ReLU -> Linear -> ReLU -> Linear
pub struct Conv1dProjector {
    conv1d: Conv1d,
    linear1: Linear,
    linear2: Linear,
}

impl Conv1dProjector {
    pub fn new(encoder_dim: usize, llm_dim: usize, k: usize, vb: VarBuilder) -> Result<Self> {
        anyhow::ensure!(k > 0, "projector downsample rate must be positive");
        let cfg = Conv1dConfig {
            stride: k,
            ..Default::default()
        };
        Ok(Self {
            conv1d: conv1d(encoder_dim, encoder_dim, k, cfg, vb.pp("conv1d"))?,
            linear1: linear(encoder_dim, PROJECTOR_HIDDEN, vb.pp("linear1"))?,
            linear2: linear(PROJECTOR_HIDDEN, llm_dim, vb.pp("linear2"))?,
        })
    }
}

impl Projector for Conv1dProjector {
    fn project(&self, features: &Tensor, _padding_mask: Option<&Tensor>) -> Result<Tensor> {
        // Conv1d wants [batch, channels, frames]
        let x = features.transpose(1, 2)?.contiguous()?;
        let x = self.conv1d.forward(&x)?.transpose(1, 2)?.relu()?;
        let x = self.linear1.forward(&x)?.relu()?;
        Ok(self.linear2.forward(&x)?)
    }
}

/// The projector selected by [`ModelConfig::encoder_projector`]
pub struct EncoderProjector {
    kind: ProjectorKind,
    inner: Box<dyn Projector>,
}

impl EncoderProjector {
    /// Build the configured projector
    ///
    /// `external` supplies the q-former; it is ignored for the built-in kinds.
    pub fn new(
        config: &ModelConfig,
        external: Option<Box<dyn Projector>>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let encoder_dim = config.encoder_dim;
        let llm_dim = config.llm.hidden_size;
        let k = config.encoder_projector_ds_rate;

        let inner: Box<dyn Projector> = match config.encoder_projector {
            ProjectorKind::Linear => Box::new(LinearProjector::new(encoder_dim, llm_dim, k, vb)?),
            ProjectorKind::Conv1dLinear => {
                Box::new(Conv1dProjector::new(encoder_dim, llm_dim, k, vb)?)
            }
            ProjectorKind::QFormer => match external {
                Some(projector) => projector,
                None => anyhow::bail!("q-former projector must be supplied by the caller"),
            },
        };

        Ok(Self {
            kind: config.encoder_projector,
            inner,
        })
    }

    pub fn kind(&self) -> ProjectorKind {
        self.kind
    }

    pub fn project(&self, features: &Tensor, padding_mask: Option<&Tensor>) -> Result<Tensor> {
        // Only the cross-attention pooling consumes the mask
        let mask = match self.kind {
            ProjectorKind::QFormer => padding_mask,
            _ => None,
        };
        self.inner.project(features, mask)
    }
}
