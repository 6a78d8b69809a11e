//! Parallel loss over the text stream and the seven audio streams

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor, D};

use crate::models::vocab::{VocabConfig, IGNORE_INDEX, NUM_AUDIO_LAYERS, NUM_STREAMS, TEXT_STREAM};

/// Training labels split per stream; a missing stream contributes nothing
#[derive(Debug, Clone, Default)]
pub struct StreamLabels {
    /// `[batch, seq]` raw ids per audio layer
    pub audio: [Option<Tensor>; NUM_AUDIO_LAYERS],
    /// `[batch, seq]` text ids
    pub text: Option<Tensor>,
}

impl StreamLabels {
    /// Split stacked labels `[batch, 8, seq]` (audio 0..7, text last)
    pub fn from_stacked(labels: &Tensor) -> Result<Self> {
        let streams = labels.dim(1)?;
        anyhow::ensure!(streams == NUM_STREAMS, "expected {} label streams, got {}", NUM_STREAMS, streams);

        let mut audio: [Option<Tensor>; NUM_AUDIO_LAYERS] = Default::default();
        for (layer, slot) in audio.iter_mut().enumerate() {
            *slot = Some(labels.i((.., layer))?.contiguous()?);
        }
        Ok(Self {
            audio,
            text: Some(labels.i((.., TEXT_STREAM))?.contiguous()?),
        })
    }

    /// Label tensor of stream `index` in stream order
    pub fn stream(&self, index: usize) -> Option<&Tensor> {
        if index == TEXT_STREAM {
            self.text.as_ref()
        } else {
            self.audio.get(index).and_then(Option::as_ref)
        }
    }
}

/// Per-stream losses, audio layers 0..7 then text; unset streams are 0
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LayerLoss(pub [f32; NUM_STREAMS]);

impl LayerLoss {
    pub fn text(&self) -> f32 {
        self.0[TEXT_STREAM]
    }

    pub fn audio(&self, layer: usize) -> f32 {
        self.0[layer]
    }

    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }
}

/// Per-stream token accuracy, `None` when not computed or nothing to score
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamAccuracy {
    pub text: Option<f32>,
    pub audio: [Option<f32>; NUM_AUDIO_LAYERS],
}

/// Cross-entropy of `logits[:, :-1]` against `labels[:, 1:]`, skipping
/// positions labelled [`IGNORE_INDEX`]
///
/// `logits` is `[batch, seq, vocab]` and `labels` `[batch, seq]`. Returns a
/// scalar; a stream with no scored position gives 0.
pub fn shifted_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    if seq_len < 2 {
        return Ok(Tensor::zeros((), DType::F32, logits.device())?);
    }
    let positions = batch * (seq_len - 1);

    let logits = logits
        .narrow(1, 0, seq_len - 1)?
        .contiguous()?
        .reshape((positions, vocab))?
        .to_dtype(DType::F32)?;
    let (targets, valid) = shifted_targets(labels)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?;

    let valid = valid.to_dtype(DType::F32)?;
    let count = valid.sum_all()?.to_scalar::<f32>()?;
    let total = (nll * &valid)?.sum_all()?;
    Ok((total / count.max(1.0) as f64)?)
}

/// Flattened `labels[:, 1:]` with ignored positions replaced by 0, plus the
/// validity mask
fn shifted_targets(labels: &Tensor) -> Result<(Tensor, Tensor)> {
    let seq_len = labels.dim(1)?;
    let labels = labels
        .narrow(1, 1, seq_len - 1)?
        .contiguous()?
        .flatten_all()?
        .to_dtype(DType::I64)?;
    let valid = labels.ne(IGNORE_INDEX)?;
    let targets = valid.where_cond(&labels, &labels.zeros_like()?)?;
    Ok((targets, valid))
}

/// Fraction of scored positions where the arg-max of `logits[:, :-1]` equals
/// `labels[:, 1:]`
pub fn shifted_accuracy(logits: &Tensor, labels: &Tensor) -> Result<Option<f32>> {
    let (_, seq_len, _) = logits.dims3()?;
    if seq_len < 2 {
        return Ok(None);
    }
    let preds = logits
        .narrow(1, 0, seq_len - 1)?
        .argmax(D::Minus1)?
        .flatten_all()?
        .to_dtype(DType::I64)?;
    let (targets, valid) = shifted_targets(labels)?;

    let valid = valid.to_dtype(DType::F32)?;
    let total = valid.sum_all()?.to_scalar::<f32>()?;
    if total == 0.0 {
        return Ok(None);
    }
    let hits = preds
        .eq(&targets)?
        .to_dtype(DType::F32)?
        .mul(&valid)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(Some(hits / total))
}

/// Segment `[batch, seq, width]` of the shared logits belonging to `stream`
pub fn stream_logits(logits: &Tensor, vocab: &VocabConfig, stream: usize) -> Result<Tensor> {
    let (offset, width) = vocab.stream_segments()[stream];
    Ok(logits.narrow(D::Minus1, offset, width)?)
}

/// Sum the shifted cross-entropy over every present stream and divide by 8
///
/// The denominator stays 8 whatever streams are present.
pub fn compute_parallel_loss(
    logits: &Tensor,
    labels: &StreamLabels,
    vocab: &VocabConfig,
) -> Result<(Tensor, LayerLoss)> {
    let mut layer_loss = LayerLoss::default();
    let mut total: Option<Tensor> = None;

    for stream in 0..NUM_STREAMS {
        let Some(stream_labels) = labels.stream(stream) else {
            continue;
        };
        let loss = shifted_cross_entropy(&stream_logits(logits, vocab, stream)?, stream_labels)?;
        layer_loss.0[stream] = loss.to_scalar::<f32>()?;
        total = Some(match total {
            Some(sum) => (sum + loss)?,
            None => loss,
        });
    }

    let total = match total {
        Some(sum) => (sum / NUM_STREAMS as f64)?,
        None => zero_loss(logits.device())?,
    };
    Ok((total, layer_loss))
}

fn zero_loss(device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((), DType::F32, device)?)
}

/// Per-stream accuracy over the present label streams
pub fn compute_stream_accuracy(
    logits: &Tensor,
    labels: &StreamLabels,
    vocab: &VocabConfig,
) -> Result<StreamAccuracy> {
    let logits = logits.detach();
    let mut accuracy = StreamAccuracy::default();
    for stream in 0..NUM_STREAMS {
        let Some(stream_labels) = labels.stream(stream) else {
            continue;
        };
        let acc = shifted_accuracy(&stream_logits(&logits, vocab, stream)?, stream_labels)?;
        if stream == TEXT_STREAM {
            accuracy.text = acc;
        } else {
            accuracy.audio[stream] = acc;
        }
    }
    Ok(accuracy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_ignored_stream_has_zero_loss() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (2, 4, 5), &device).unwrap();
        let labels = Tensor::full(IGNORE_INDEX, (2, 4), &device).unwrap();
        let loss = shifted_cross_entropy(&logits, &labels).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[IGNORE_INDEX, 2, 1]], &device).unwrap();
        let loss = shifted_cross_entropy(&logits, &labels).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_labels_are_shifted() {
        let device = Device::Cpu;
        // Position 0 strongly predicts id 1, position 1 strongly predicts id 0
        let logits = Tensor::new(&[[[0f32, 20.0], [20.0, 0.0], [0.0, 0.0]]], &device).unwrap();
        let labels = Tensor::new(&[[IGNORE_INDEX, 1, 0]], &device).unwrap();
        let loss = shifted_cross_entropy(&logits, &labels).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss < 1e-4);
        assert_eq!(shifted_accuracy(&logits, &labels).unwrap(), Some(1.0));
    }

    #[test]
    fn test_accuracy_none_without_scored_positions() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::full(IGNORE_INDEX, (1, 3), &device).unwrap();
        assert_eq!(shifted_accuracy(&logits, &labels).unwrap(), None);
    }

    #[test]
    fn test_parallel_loss_identity() {
        let device = Device::Cpu;
        let vocab = VocabConfig::new(6, 2, 3, 1);
        let logits = Tensor::randn(0f32, 1.0, (2, 5, vocab.total_vocabsize()), &device).unwrap();
        let stacked = Tensor::new(
            &[[[-100i64, 1, 2, 3, 0]; NUM_STREAMS], [[-100i64, 0, 1, -100, 2]; NUM_STREAMS]],
            &device,
        )
        .unwrap();
        let labels = StreamLabels::from_stacked(&stacked).unwrap();
        let (total, layer_loss) = compute_parallel_loss(&logits, &labels, &vocab).unwrap();
        let total = total.to_scalar::<f32>().unwrap();
        assert!((total * 8.0 - layer_loss.sum()).abs() < 1e-4);
        assert!(layer_loss.text() > 0.0);
        assert!(layer_loss.audio(6) > 0.0);
    }

    #[test]
    fn test_missing_streams_keep_denominator() {
        let device = Device::Cpu;
        let vocab = VocabConfig::new(6, 2, 3, 1);
        let logits = Tensor::randn(0f32, 1.0, (1, 4, vocab.total_vocabsize()), &device).unwrap();
        let labels = StreamLabels {
            text: Some(Tensor::new(&[[-100i64, 1, 2, 3]], &device).unwrap()),
            ..Default::default()
        };
        let (total, layer_loss) = compute_parallel_loss(&logits, &labels, &vocab).unwrap();
        let total = total.to_scalar::<f32>().unwrap();
        assert!((total - layer_loss.text() / 8.0).abs() < 1e-5);
        assert_eq!(layer_loss.audio(0), 0.0);
    }

    #[test]
    fn test_no_labels_give_zero_loss() {
        let device = Device::Cpu;
        let vocab = VocabConfig::new(6, 2, 3, 1);
        let logits = Tensor::zeros((1, 4, vocab.total_vocabsize()), DType::F32, &device).unwrap();
        let (total, layer_loss) =
            compute_parallel_loss(&logits, &StreamLabels::default(), &vocab).unwrap();
        assert_eq!(total.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(layer_loss, LayerLoss::default());
    }

    #[test]
    fn test_stream_accuracy_follows_labels() {
        let device = Device::Cpu;
        let vocab = VocabConfig::new(6, 2, 3, 1);
        let logits = Tensor::zeros((1, 3, vocab.total_vocabsize()), DType::F32, &device).unwrap();
        let labels = StreamLabels {
            text: Some(Tensor::new(&[[-100i64, 0, 0]], &device).unwrap()),
            ..Default::default()
        };
        let accuracy = compute_stream_accuracy(&logits, &labels, &vocab).unwrap();
        // Arg-max of all-zero logits is id 0
        assert_eq!(accuracy.text, Some(1.0));
        assert_eq!(accuracy.audio[0], None);
    }
}
