//! Training-side helpers: the parallel loss and one optimisation step
//!
//! The training loop itself (data loading, scheduling, checkpointing) lives
//! with the caller.

pub mod loss;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Tensor;
use candle_nn::Optimizer;

use crate::models::transplant::PartialFreeze;

pub use loss::{
    compute_parallel_loss, compute_stream_accuracy, shifted_accuracy, shifted_cross_entropy,
    LayerLoss, StreamAccuracy, StreamLabels,
};

/// Backward pass with the partial-freeze gradient transform applied
pub fn backward(loss: &Tensor, freeze: Option<&PartialFreeze>) -> Result<GradStore> {
    let mut grads = loss.backward()?;
    if let Some(freeze) = freeze {
        freeze.mask_gradients(&mut grads)?;
    }
    Ok(grads)
}

/// Backward pass followed by one optimizer step
pub fn train_step<O: Optimizer>(
    optimizer: &mut O,
    loss: &Tensor,
    freeze: Option<&PartialFreeze>,
) -> Result<()> {
    let grads = backward(loss, freeze)?;
    optimizer.step(&grads)?;
    Ok(())
}
