//! Stream merge: eight per-stream embeddings in, one embedding per timestep out

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use super::lm::CausalLm;
use super::vocab::{VocabConfig, NUM_AUDIO_LAYERS, NUM_STREAMS};

/// Task of one training sample: input modality 1, output modality 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    A1A2,
    A1T2,
    T1A2,
    T1T2,
}

impl Task {
    /// Whether the sample's prompt carries encoded audio
    pub fn has_audio_input(&self) -> bool {
        matches!(self, Task::A1A2 | Task::A1T2)
    }
}

/// Replace `-1` placeholders in the input streams by `0`
pub fn sanitize_input_ids(input_ids: &Tensor) -> Result<Tensor> {
    let input_ids = input_ids.to_dtype(DType::I64)?;
    let placeholder = input_ids.eq(-1i64)?;
    Ok(placeholder.where_cond(&input_ids.zeros_like()?, &input_ids)?)
}

/// Where the audio span sits inside one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModalitySpan {
    pub start: usize,
    pub len: usize,
}

impl ModalitySpan {
    /// First set position of `mask` and the number of set positions, clamped to
    /// the encoder length and to the end of the sequence
    ///
    /// Assumes a single contiguous span; with several spans only the start of
    /// the first one is honoured.
    pub fn from_mask(mask: &[u8], encoder_len: usize) -> Self {
        let start = mask.iter().position(|&m| m != 0).unwrap_or(0);
        let count = mask.iter().filter(|&&m| m != 0).count();
        let len = count.min(encoder_len).min(mask.len() - start);
        Self { start, len }
    }
}

/// Training-time merge
///
/// `embeds` is `[batch, 8, seq, hidden]`. With a modality mask `[batch, seq]`,
/// each audio channel of each audio-input sample gets the encoder output
/// written over its span while the rest of the channel is kept only where the
/// mask is unset. The eight streams are then averaged to `[batch, seq, hidden]`.
pub fn merge_training_streams(
    embeds: &Tensor,
    encoder_out: Option<&Tensor>,
    modality_mask: Option<&Tensor>,
    tasks: Option<&[Task]>,
) -> Result<Tensor> {
    let Some(modality_mask) = modality_mask else {
        return Ok(embeds.mean(1)?);
    };
    let encoder_out = encoder_out.context("modality mask given without encoder output")?;

    let (batch, streams, seq_len, hidden) = embeds.dims4()?;
    anyhow::ensure!(streams == NUM_STREAMS, "expected {} streams, got {}", NUM_STREAMS, streams);
    let encoder_len = encoder_out.dim(1)?;
    let dtype = embeds.dtype();
    let device = embeds.device();

    let mut samples = Vec::with_capacity(batch);
    for b in 0..batch {
        let sample = embeds.i(b)?;
        let mask_row: Vec<u8> = modality_mask.i(b)?.to_dtype(DType::U8)?.to_vec1()?;
        let span = ModalitySpan::from_mask(&mask_row, encoder_len);
        let skip = tasks.is_some_and(|t| !t[b].has_audio_input());

        if skip || mask_row.iter().all(|&m| m == 0) {
            samples.push(sample);
            continue;
        }

        let keep: Vec<f32> = mask_row.iter().map(|&m| if m != 0 { 0.0 } else { 1.0 }).collect();
        let keep = Tensor::new(keep.as_slice(), device)?
            .to_dtype(dtype)?
            .reshape((1, seq_len, 1))?;
        let spliced = encoder_pad(encoder_out.i(b)?, span, seq_len, hidden, dtype, device)?;

        let audio = sample
            .narrow(0, 0, NUM_AUDIO_LAYERS)?
            .broadcast_mul(&keep)?
            .broadcast_add(&spliced.unsqueeze(0)?)?;
        let text = sample.narrow(0, NUM_AUDIO_LAYERS, 1)?;
        samples.push(Tensor::cat(&[&audio, &text], 0)?);
    }

    Ok(Tensor::stack(&samples, 0)?.mean(1)?)
}

/// Encoder features placed at `span` inside a zero `[seq_len, hidden]` tensor
fn encoder_pad(
    features: Tensor,
    span: ModalitySpan,
    seq_len: usize,
    hidden: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let mut parts = Vec::with_capacity(3);
    if span.start > 0 {
        parts.push(Tensor::zeros((span.start, hidden), dtype, device)?);
    }
    if span.len > 0 {
        parts.push(features.narrow(0, 0, span.len)?.to_dtype(dtype)?);
    }
    let tail = seq_len - span.start - span.len;
    if tail > 0 {
        parts.push(Tensor::zeros((tail, hidden), dtype, device)?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}

/// Decode-time merge of one step's eight tokens into `[1, 1, hidden]`
///
/// `tokens` holds raw audio ids for streams 0..7 and a text id at index 7.
pub fn merge_step_tokens<L: CausalLm>(
    lm: &L,
    vocab: &VocabConfig,
    tokens: &[u32; NUM_STREAMS],
    device: &Device,
) -> Result<Tensor> {
    let ids: Vec<u32> = tokens
        .iter()
        .enumerate()
        .map(|(stream, &token)| {
            if stream < NUM_AUDIO_LAYERS {
                vocab.layershift(token, stream)
            } else {
                token
            }
        })
        .collect();
    let ids = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
    let embeds = lm.embed_tokens(&ids)?;
    Ok(embeds.mean_keepdim(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Module;
    use candle_nn::Embedding;

    struct EmbedOnly {
        embedding: Embedding,
    }

    impl CausalLm for EmbedOnly {
        type Cache = ();

        fn vocab_size(&self) -> usize {
            self.embedding.embeddings().dim(0).unwrap_or(0)
        }

        fn hidden_size(&self) -> usize {
            self.embedding.hidden_size()
        }

        fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
            Ok(self.embedding.forward(input_ids)?)
        }

        fn forward(&self, _inputs_embeds: &Tensor, _attention_mask: Option<&Tensor>) -> Result<Tensor> {
            anyhow::bail!("not a language model")
        }

        fn new_cache(&self) {}

        fn step(&self, _inputs_embeds: &Tensor, _attention_mask: &Tensor, _cache: &mut ()) -> Result<Tensor> {
            anyhow::bail!("not a language model")
        }
    }

    #[test]
    fn test_sanitize_input_ids() {
        let device = Device::Cpu;
        let ids = Tensor::new(&[[-1i64, 5, -1, 7]], &device).unwrap();
        let clean: Vec<i64> = sanitize_input_ids(&ids).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(clean, vec![0, 5, 0, 7]);
    }

    #[test]
    fn test_modality_span_clamping() {
        assert_eq!(
            ModalitySpan::from_mask(&[0, 1, 1, 1, 0], 10),
            ModalitySpan { start: 1, len: 3 }
        );
        assert_eq!(
            ModalitySpan::from_mask(&[0, 1, 1, 1, 0], 2),
            ModalitySpan { start: 1, len: 2 }
        );
        assert_eq!(ModalitySpan::from_mask(&[0, 0, 0], 4).len, 0);
    }

    #[test]
    fn test_merge_without_mask_is_mean() {
        let device = Device::Cpu;
        let embeds = Tensor::randn(0f32, 1.0, (2, 8, 3, 4), &device).unwrap();
        let merged = merge_training_streams(&embeds, None, None, None).unwrap();
        assert_eq!(merged.dims(), &[2, 3, 4]);
        let expected: Vec<f32> = embeds.mean(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let actual: Vec<f32> = merged.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_merge_splices_encoder_output() {
        let device = Device::Cpu;
        // Every stream embedding is 1.0, encoder output is 9.0
        let embeds = Tensor::ones((1, 8, 4, 2), DType::F32, &device).unwrap();
        let encoder_out = Tensor::full(9f32, (1, 3, 2), &device).unwrap();
        let mask = Tensor::new(&[[0u8, 1, 1, 0]], &device).unwrap();
        let merged = merge_training_streams(&embeds, Some(&encoder_out), Some(&mask), None).unwrap();
        let merged: Vec<Vec<f32>> = merged.i(0).unwrap().to_vec2().unwrap();

        // Unmasked: all eight streams are 1.0
        assert!((merged[0][0] - 1.0).abs() < 1e-6);
        assert!((merged[3][0] - 1.0).abs() < 1e-6);
        // Masked: seven audio channels carry 9.0, text stays 1.0
        let expected = (7.0 * 9.0 + 1.0) / 8.0;
        assert!((merged[1][0] - expected).abs() < 1e-5);
        assert!((merged[2][1] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_merge_skips_text_input_tasks() {
        let device = Device::Cpu;
        let embeds = Tensor::ones((2, 8, 3, 2), DType::F32, &device).unwrap();
        let encoder_out = Tensor::full(5f32, (2, 3, 2), &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 0], [1, 1, 0]], &device).unwrap();
        let tasks = [Task::A1T2, Task::T1A2];
        let merged =
            merge_training_streams(&embeds, Some(&encoder_out), Some(&mask), Some(&tasks)).unwrap();
        let spliced: Vec<Vec<f32>> = merged.i(0).unwrap().to_vec2().unwrap();
        let untouched: Vec<Vec<f32>> = merged.i(1).unwrap().to_vec2().unwrap();
        assert!((spliced[0][0] - 4.5).abs() < 1e-5);
        assert!((untouched[0][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_step_merge_is_mean_of_shifted_embeddings() {
        let device = Device::Cpu;
        let vocab = VocabConfig::new(90, 10, 40, 10);
        let table = Tensor::randn(0f32, 1.0, (vocab.total_vocabsize(), 6), &device).unwrap();
        let lm = EmbedOnly {
            embedding: Embedding::new(table.clone(), 6),
        };

        let tokens = [3u32, 4, 5, 6, 7, 8, 9, 42];
        let merged = merge_step_tokens(&lm, &vocab, &tokens, &device).unwrap();
        assert_eq!(merged.dims(), &[1, 1, 6]);

        let mut expected = vec![0f32; 6];
        for (stream, &token) in tokens.iter().enumerate() {
            let id = if stream < NUM_AUDIO_LAYERS {
                vocab.layershift(token, stream)
            } else {
                token
            };
            let row: Vec<f32> = table.i(id as usize).unwrap().to_vec1().unwrap();
            for (e, r) in expected.iter_mut().zip(row) {
                *e += r / NUM_STREAMS as f32;
            }
        }
        let actual: Vec<f32> = merged.flatten_all().unwrap().to_vec1().unwrap();
        for (e, a) in expected.iter().zip(actual.iter()) {
            assert!((e - a).abs() < 1e-5);
        }
    }
}
