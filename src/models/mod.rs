//! Model components for parallel speech-to-speech decoding
//!
//! This module contains:
//! - `vocab`: Shared text + audio vocabulary layout
//! - `config`: Model and training configuration
//! - `lm`: Interface to the autoregressive language model
//! - `backbone`: Qwen2-style reference implementation of that interface
//! - `encoder`, `projector`: Audio front-end and its projection into the LM
//! - `merge`: Stream merging for training and decoding
//! - `transplant`: Vocabulary resizing and partial freezing
//! - `codec_decoder`: Optional waveform decoder interface
//! - `s2s`: The assembled model

pub mod backbone;
pub mod codec_decoder;
pub mod config;
pub mod encoder;
pub mod lm;
pub mod merge;
pub mod projector;
pub mod s2s;
pub mod transplant;
pub mod vocab;

pub use backbone::QwenBackbone;
pub use codec_decoder::CodecDecoder;
pub use config::{BackboneConfig, ModelConfig, TrainConfig};
pub use encoder::{AudioEncoder, AudioFeatures, EncoderKind, EncoderOutput, FeatureExtractor};
pub use lm::CausalLm;
pub use merge::Task;
pub use projector::{EncoderProjector, Projector, ProjectorKind};
pub use s2s::{load_qwen_s2s, ForwardOutput, LoadedS2S, S2SBatch, S2SComponents, SlamS2S};
pub use transplant::{partial_freeze_weights, resize_token_embeddings, PartialFreeze};
pub use vocab::VocabConfig;
