//! Vocabulary transplant: grow the embedding table and output projection to
//! the combined text + audio vocabulary, and optionally restrict training to
//! the newly added output rows.
//!
//! Parameters live in a [`VarMap`]. Resizing replaces the stored [`Var`]s, so
//! it must happen before any module is built from the map.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use std::path::Path;

use super::backbone::{EMBED_TOKENS_KEY, LM_HEAD_KEY};

/// Load every tensor of a safetensors file into `varmap` as a trainable variable
pub fn load_into_varmap<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    dtype: DType,
    device: &Device,
) -> Result<usize> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load weights from {}", path.display()))?;

    let mut data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let count = tensors.len();
    for (name, tensor) in tensors {
        data.insert(name, Var::from_tensor(&tensor.to_dtype(dtype)?)?);
    }

    tracing::info!("Loaded {} tensors from {}", count, path.display());
    Ok(count)
}

/// Resize the input embedding table and the output projection to `new_rows`
///
/// Added rows are drawn from N(0, `init_std`). With `tied` only the embedding
/// table is resized, since the output projection is built over it. Untied, a
/// missing output projection is created as a copy of the resized table.
/// Returns the previous row count.
pub fn resize_token_embeddings(
    varmap: &VarMap,
    new_rows: usize,
    init_std: f64,
    tied: bool,
) -> Result<usize> {
    let mut data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;

    let embed = data
        .get(EMBED_TOKENS_KEY)
        .with_context(|| format!("missing {}", EMBED_TOKENS_KEY))?
        .as_tensor()
        .clone();
    let original_rows = embed.dim(0)?;
    if original_rows == new_rows {
        return Ok(original_rows);
    }

    let resized = resize_rows(&embed, new_rows, init_std)?;
    if tied {
        if data.remove(LM_HEAD_KEY).is_some() {
            tracing::warn!("Dropping {} in favour of the tied embedding table", LM_HEAD_KEY);
        }
    } else {
        let lm_head = match data.get(LM_HEAD_KEY) {
            Some(head) => resize_rows(head.as_tensor(), new_rows, init_std)?,
            None => {
                tracing::info!("No separate output projection, untying it from the embeddings");
                resized.copy()?
            }
        };
        data.insert(LM_HEAD_KEY.to_string(), Var::from_tensor(&lm_head)?);
    }
    data.insert(EMBED_TOKENS_KEY.to_string(), Var::from_tensor(&resized)?);

    tracing::info!(
        "Resized LM embedding layer's vocab size from {} to {}",
        original_rows,
        new_rows
    );
    Ok(original_rows)
}

fn resize_rows(weight: &Tensor, new_rows: usize, init_std: f64) -> Result<Tensor> {
    let (rows, cols) = weight.dims2()?;
    if new_rows <= rows {
        return Ok(weight.narrow(0, 0, new_rows)?.contiguous()?);
    }
    let added = Tensor::randn(0f32, init_std as f32, (new_rows - rows, cols), weight.device())?
        .to_dtype(weight.dtype())?;
    Ok(Tensor::cat(&[weight, &added], 0)?)
}

/// Freeze everything except rows `[original, total)` of the output projection
/// stored under `output_key`
///
/// Those rows are re-initialised with He initialisation, std `sqrt(2 / fan_in)`.
/// When the projection is tied to the embedding table the same rows are also
/// the input embeddings of the new tokens, and they train through both uses.
/// The returned [`PartialFreeze`] must be applied to every gradient store
/// before the optimizer sees it.
pub fn partial_freeze_weights(
    varmap: &VarMap,
    output_key: &str,
    original_rows: usize,
    total_rows: usize,
) -> Result<PartialFreeze> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let output = data
        .get(output_key)
        .with_context(|| format!("missing {}", output_key))?
        .clone();

    let (rows, fan_in) = output.dims2()?;
    anyhow::ensure!(
        original_rows <= total_rows && total_rows <= rows,
        "trainable rows [{}, {}) outside output projection of {} rows",
        original_rows,
        total_rows,
        rows
    );

    let std = (2.0 / fan_in as f64).sqrt();
    let weight = output.as_tensor();
    let fresh = Tensor::randn(0f32, std as f32, (total_rows - original_rows, fan_in), weight.device())?
        .to_dtype(weight.dtype())?;
    let mut parts = vec![weight.narrow(0, 0, original_rows)?, fresh];
    if total_rows < rows {
        parts.push(weight.narrow(0, total_rows, rows - total_rows)?);
    }
    output.set(&Tensor::cat(&parts, 0)?)?;

    let row_mask: Vec<f32> = (0..rows)
        .map(|r| if (original_rows..total_rows).contains(&r) { 1.0 } else { 0.0 })
        .collect();
    let row_mask = Tensor::new(row_mask.as_slice(), weight.device())?.reshape((rows, 1))?;

    let frozen: Vec<Var> = data
        .iter()
        .filter(|(name, _)| name.as_str() != output_key)
        .map(|(_, var)| var.clone())
        .collect();

    tracing::info!(
        "Only training rows [{}, {}) of {}; {} other tensors frozen",
        original_rows,
        total_rows,
        output_key,
        frozen.len()
    );

    Ok(PartialFreeze {
        output,
        row_mask,
        trainable_rows: total_rows - original_rows,
        frozen,
    })
}

/// Gradient transform produced by [`partial_freeze_weights`]
///
/// Call [`PartialFreeze::mask_gradients`] after every backward pass and
/// before the optimizer step. The transform is linear, so masking each store
/// and then summing gives the same result as masking the accumulated sum.
pub struct PartialFreeze {
    output: Var,
    row_mask: Tensor,
    trainable_rows: usize,
    frozen: Vec<Var>,
}

impl PartialFreeze {
    /// Variables the optimizer should be built over
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.output.clone()]
    }

    /// Number of trainable scalars
    pub fn trainable_params(&self) -> Result<usize> {
        Ok(self.trainable_rows * self.output.dim(1)?)
    }

    /// Drop gradients of frozen tensors and zero the frozen output rows
    pub fn mask_gradients(&self, grads: &mut GradStore) -> Result<()> {
        for var in &self.frozen {
            grads.remove(var.as_tensor());
        }
        if let Some(grad) = grads.remove(self.output.as_tensor()) {
            let masked = grad.broadcast_mul(&self.row_mask.to_dtype(grad.dtype())?)?;
            grads.insert(self.output.as_tensor(), masked);
        }
        Ok(())
    }
}

/// Total and trainable parameter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSummary {
    pub total: usize,
    pub trainable: usize,
}

impl ParameterSummary {
    /// Count the parameters in `varmap`; with a freeze in place only the
    /// trainable output rows count as trainable
    pub fn collect(varmap: &VarMap, freeze: Option<&PartialFreeze>) -> Result<Self> {
        let total = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        let trainable = match freeze {
            Some(freeze) => freeze.trainable_params()?,
            None => total,
        };
        Ok(Self { total, trainable })
    }

    pub fn log(&self) {
        tracing::info!(
            "Model parameters: {:.2} M total, {:.2} M trainable",
            self.total as f64 / 1e6,
            self.trainable as f64 / 1e6
        );
    }
}
