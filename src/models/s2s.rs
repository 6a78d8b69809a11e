//! Speech-to-speech model: audio encoder + projector + multi-stream LM

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;

use super::backbone::{output_projection_key, QwenBackbone, EMBED_TOKENS_KEY};
use super::codec_decoder::{stack_audio_codes, CodecDecoder};
use super::config::{ModelConfig, TrainConfig};
use super::encoder::{AudioEncoder, AudioFeatures, FeatureExtractor};
use super::lm::CausalLm;
use super::merge::{merge_training_streams, sanitize_input_ids, Task};
use super::projector::{EncoderProjector, Projector};
use super::transplant::{
    load_into_varmap, partial_freeze_weights, resize_token_embeddings, ParameterSummary,
    PartialFreeze,
};
use super::vocab::{VocabConfig, NUM_STREAMS};
use crate::generation::{generate, GeneratedStreams, GenerationConfig};
use crate::training::loss::{
    compute_parallel_loss, compute_stream_accuracy, LayerLoss, StreamAccuracy, StreamLabels,
};

/// One batch of multi-stream inputs
#[derive(Debug, Clone)]
pub struct S2SBatch {
    /// `[batch, 8, seq]` ids, audio layers 0..7 (already layer-shifted) then text
    pub input_ids: Tensor,
    /// `[batch, seq]`, 1 = attend
    pub attention_mask: Option<Tensor>,
    pub labels: Option<StreamLabels>,
    pub audio: AudioFeatures,
    /// `[batch, seq]`, set over the span that carries encoded audio
    pub modality_mask: Option<Tensor>,
    pub tasks: Option<Vec<Task>>,
}

impl S2SBatch {
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            labels: None,
            audio: AudioFeatures::default(),
            modality_mask: None,
            tasks: None,
        }
    }

    /// Single-sample prompt for a text-input task
    pub fn text_prompt(vocab: &VocabConfig, text_ids: &[u32], device: &Device) -> Result<Self> {
        let streams = vocab.text_prompt_streams(text_ids);
        let seq_len = text_ids.len() + 1;
        let flat: Vec<u32> = streams.into_iter().flatten().collect();
        let input_ids = Tensor::new(flat.as_slice(), device)?
            .reshape((1, NUM_STREAMS, seq_len))?
            .to_dtype(DType::I64)?;
        Ok(Self {
            tasks: Some(vec![Task::T1A2]),
            ..Self::new(input_ids)
        })
    }
}

/// Result of a training forward pass
#[derive(Debug)]
pub struct ForwardOutput {
    /// `[batch, seq, total_vocab]`
    pub logits: Tensor,
    /// Scalar loss when labels were given
    pub loss: Option<Tensor>,
    pub accuracy: StreamAccuracy,
    pub layer_loss: LayerLoss,
}

/// Parallel text + audio speech-to-speech model over any [`CausalLm`]
pub struct SlamS2S<L: CausalLm> {
    llm: L,
    encoder: AudioEncoder,
    projector: EncoderProjector,
    codec_decoder: Option<Box<dyn CodecDecoder>>,
    model_config: ModelConfig,
    train_config: TrainConfig,
}

impl<L: CausalLm> SlamS2S<L> {
    pub fn new(
        llm: L,
        encoder: AudioEncoder,
        projector: EncoderProjector,
        model_config: ModelConfig,
        train_config: TrainConfig,
    ) -> Result<Self> {
        let total = model_config.vocab_config.total_vocabsize();
        anyhow::ensure!(
            llm.vocab_size() == total,
            "LM vocabulary {} does not match the combined layout {}",
            llm.vocab_size(),
            total
        );

        Ok(Self {
            llm,
            encoder,
            projector,
            codec_decoder: None,
            model_config,
            train_config,
        })
    }

    /// Attach a codec decoder for [`SlamS2S::decode_audio`]
    pub fn with_codec_decoder(mut self, codec_decoder: Box<dyn CodecDecoder>) -> Self {
        self.codec_decoder = Some(codec_decoder);
        self
    }

    pub fn llm(&self) -> &L {
        &self.llm
    }

    pub fn vocab(&self) -> &VocabConfig {
        &self.model_config.vocab_config
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    /// Merged input embeddings `[batch, seq, hidden]`
    pub fn prepare_inputs(&self, batch: &S2SBatch) -> Result<Tensor> {
        let encoder_out = match self.encoder.encode(&batch.audio)? {
            Some(out) => Some(self.projector.project(&out.features, out.padding_mask.as_ref())?),
            None => None,
        };

        let input_ids = sanitize_input_ids(&batch.input_ids)?.to_dtype(DType::U32)?;
        let embeds = self.llm.embed_tokens(&input_ids)?;

        merge_training_streams(
            &embeds,
            encoder_out.as_ref(),
            batch.modality_mask.as_ref(),
            batch.tasks.as_deref(),
        )
    }

    /// Training forward: logits, parallel loss, per-stream losses and accuracy
    pub fn forward(&self, batch: &S2SBatch) -> Result<ForwardOutput> {
        let inputs_embeds = self.prepare_inputs(batch)?;
        let logits = self.llm.forward(&inputs_embeds, batch.attention_mask.as_ref())?;

        let vocab = self.vocab();
        let (loss, layer_loss, accuracy) = match &batch.labels {
            Some(labels) => {
                let (loss, layer_loss) = compute_parallel_loss(&logits, labels, vocab)?;
                let accuracy = if self.train_config.compute_metrics {
                    compute_stream_accuracy(&logits, labels, vocab)?
                } else {
                    StreamAccuracy::default()
                };
                (Some(loss), layer_loss, accuracy)
            }
            None => (None, LayerLoss::default(), StreamAccuracy::default()),
        };

        Ok(ForwardOutput {
            logits,
            loss,
            accuracy,
            layer_loss,
        })
    }

    /// Decode the eight streams for a single prompt
    pub fn generate(&self, batch: &S2SBatch, config: &GenerationConfig) -> Result<GeneratedStreams> {
        let inputs_embeds = self.prepare_inputs(batch)?;
        generate(
            &self.llm,
            self.vocab(),
            &inputs_embeds,
            batch.attention_mask.as_ref(),
            config,
        )
    }

    /// Turn generated audio streams into a waveform with the attached codec
    pub fn decode_audio(&self, generated: &GeneratedStreams, device: &Device) -> Result<Tensor> {
        let codec = self
            .codec_decoder
            .as_ref()
            .context("no codec decoder configured")?;
        let codes = stack_audio_codes(
            generated.audio_streams(),
            self.vocab().audio_vocabsize as u32,
            device,
        )?;
        codec.decode(&codes)
    }

    /// Sample rate of the attached codec, if any
    pub fn sample_rate(&self) -> Option<u32> {
        self.codec_decoder.as_ref().map(|c| c.sample_rate())
    }
}

/// A [`SlamS2S`] over the reference backbone together with its parameters
pub struct LoadedS2S {
    pub model: SlamS2S<QwenBackbone>,
    pub varmap: VarMap,
    /// Present when only the new output rows train
    pub freeze: Option<PartialFreeze>,
}

/// External pieces [`load_qwen_s2s`] cannot build itself
#[derive(Default)]
pub struct S2SComponents {
    pub encoder: Option<Box<dyn FeatureExtractor>>,
    pub qformer: Option<Box<dyn Projector>>,
    /// Required when `codec_decode` is set
    pub codec: Option<Box<dyn CodecDecoder>>,
}

/// Build the model over [`QwenBackbone`], optionally from a safetensors file
///
/// Weights are loaded first, the vocabulary is grown to the combined layout,
/// then every module is built over the same [`VarMap`]. With
/// `train_audio_embed_only` the returned [`PartialFreeze`] must be applied to
/// each gradient store.
pub fn load_qwen_s2s(
    model_config: ModelConfig,
    train_config: TrainConfig,
    weights: Option<&Path>,
    components: S2SComponents,
    dtype: DType,
    device: &Device,
) -> Result<LoadedS2S> {
    let codec = match (model_config.codec_decode, components.codec) {
        (true, Some(codec)) => Some(codec),
        (true, None) => anyhow::bail!("codec_decode is set but no codec decoder was supplied"),
        (false, Some(_)) => {
            tracing::warn!("Codec decoder supplied without codec_decode, ignoring it");
            None
        }
        (false, None) => None,
    };

    let varmap = VarMap::new();
    if let Some(path) = weights {
        load_into_varmap(&varmap, path, dtype, device)?;
    }

    let vocab = model_config.vocab_config.clone();
    let total = vocab.total_vocabsize();
    let tied = model_config.llm.tie_word_embeddings;
    let has_embeddings = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?
        .contains_key(EMBED_TOKENS_KEY);
    if has_embeddings && model_config.needs_resize() {
        resize_token_embeddings(&varmap, total, model_config.llm.initializer_range, tied)?;
    }

    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let llm = QwenBackbone::new(model_config.llm.clone(), total, vb.clone())?;
    let projector = EncoderProjector::new(&model_config, components.qformer, vb.pp("encoder_projector"))?;
    let encoder = AudioEncoder::new(
        model_config.encoder_name,
        components.encoder,
        train_config.freeze_encoder,
    )?;

    let freeze = match (train_config.train_audio_embed_only, model_config.needs_resize()) {
        (true, true) => {
            tracing::info!("Only training audio embedding layer");
            Some(partial_freeze_weights(
                &varmap,
                output_projection_key(&model_config.llm),
                vocab.padded_text_vocabsize(),
                total,
            )?)
        }
        (true, false) => {
            tracing::warn!("Vocabulary already matches the combined layout, not freezing");
            None
        }
        (false, _) => None,
    };
    ParameterSummary::collect(&varmap, freeze.as_ref())?.log();

    let mut model = SlamS2S::new(llm, encoder, projector, model_config, train_config)?;
    if let Some(codec) = codec {
        model = model.with_codec_decoder(codec);
    }
    Ok(LoadedS2S {
        model,
        varmap,
        freeze,
    })
}
