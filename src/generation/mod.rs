//! Parallel multi-stream generation
//!
//! This module provides:
//! - Generation configuration and per-stream token selection
//! - Sign-aware repetition penalty
//! - The step-wise decode loop over an explicit [`DecodeState`]

mod decode;
mod sampling;

pub use decode::{decode_step, generate, DecodeState, DecodeStatus, GeneratedStreams};
pub use sampling::{apply_repetition_penalty, greedy_sample, GenerationConfig, Sampler};
