//! Parallel autoregressive decoding of one text stream and seven audio streams
//!
//! Every step scores the shared vocabulary once, splits the logits into the
//! eight stream segments and picks one id per stream. Streams that have
//! ended keep emitting their pad id so all eight stay the same length.
//! Generation stops when the last audio layer emits end-of-audio or the step
//! budget runs out; a text end alone does not stop it.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor, D};

use super::sampling::{apply_repetition_penalty, GenerationConfig, Sampler};
use crate::models::lm::CausalLm;
use crate::models::merge::merge_step_tokens;
use crate::models::vocab::{VocabConfig, NUM_AUDIO_LAYERS, NUM_STREAMS, TEXT_STREAM};

/// Where the decode loop stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Both text and audio still sampling
    Generating,
    /// Text emitted end-of-text and now emits padding; audio continues
    TextEnded,
    /// The last audio layer emitted end-of-audio; terminal
    AudioEnded,
}

/// Everything one generation call mutates from step to step
pub struct DecodeState<C> {
    /// Incremental transformer state
    pub cache: C,
    /// Ids appended so far per stream, used for the repetition penalty
    pub history: [Vec<u32>; NUM_STREAMS],
    /// Ids picked at the last step and not yet fed back
    pub current: Option<[u32; NUM_STREAMS]>,
    pub text_end: bool,
    pub audio_end: bool,
    /// `[1, positions]` attention mask over everything the cache has seen plus
    /// the next input
    pub attention_mask: Tensor,
    /// Number of completed steps
    pub steps: usize,
}

impl<C> DecodeState<C> {
    pub fn new(cache: C, attention_mask: Tensor) -> Self {
        Self {
            cache,
            history: Default::default(),
            current: None,
            text_end: false,
            audio_end: false,
            attention_mask,
            steps: 0,
        }
    }

    pub fn status(&self) -> DecodeStatus {
        if self.audio_end {
            DecodeStatus::AudioEnded
        } else if self.text_end {
            DecodeStatus::TextEnded
        } else {
            DecodeStatus::Generating
        }
    }

    /// Final streams: the history plus the terminal step's ids when audio
    /// ended, with text cut at its first end-of-text
    pub fn finish(self, vocab: &VocabConfig) -> GeneratedStreams {
        let mut streams = self.history;
        if self.audio_end {
            if let Some(current) = self.current {
                for (stream, token) in streams.iter_mut().zip(current) {
                    stream.push(token);
                }
            }
        }

        let eot = vocab.eot();
        let text = &mut streams[TEXT_STREAM];
        if let Some(end) = text.iter().position(|&t| t == eot) {
            text.truncate(end);
        }

        GeneratedStreams {
            streams: streams.into(),
            steps: self.steps,
            audio_ended: self.audio_end,
        }
    }
}

/// Output of [`generate`]: eight sequences, audio layers 0..7 then text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedStreams {
    pub streams: Vec<Vec<u32>>,
    /// Decode steps taken, including the terminal one
    pub steps: usize,
    /// Whether generation stopped on end-of-audio rather than the budget
    pub audio_ended: bool,
}

impl GeneratedStreams {
    pub fn text(&self) -> &[u32] {
        &self.streams[TEXT_STREAM]
    }

    pub fn audio(&self, layer: usize) -> &[u32] {
        &self.streams[layer]
    }

    pub fn audio_streams(&self) -> &[Vec<u32>] {
        &self.streams[..NUM_AUDIO_LAYERS]
    }
}

/// Run one decode step
///
/// `prompt_embeds` is fed on the first step only; later steps feed the merged
/// embedding of the previous step's eight ids.
pub fn decode_step<L: CausalLm>(
    lm: &L,
    vocab: &VocabConfig,
    state: &mut DecodeState<L::Cache>,
    prompt_embeds: &Tensor,
    config: &GenerationConfig,
    sampler: &mut Sampler,
) -> Result<DecodeStatus> {
    let device = prompt_embeds.device();
    let inputs_embeds = match &state.current {
        Some(tokens) => merge_step_tokens(lm, vocab, tokens, device)?,
        None => prompt_embeds.clone(),
    };

    let logits = lm.step(&inputs_embeds, &state.attention_mask, &mut state.cache)?;
    let last = logits.dim(1)? - 1;
    let logits = logits.i((0, last))?;

    let segments = vocab.stream_segments();
    let mut tokens = [0u32; NUM_STREAMS];
    for (stream, token) in tokens.iter_mut().enumerate() {
        let ended = if stream == TEXT_STREAM {
            state.text_end
        } else {
            state.audio_end
        };
        if ended {
            *token = if stream == TEXT_STREAM {
                vocab.pad_t()
            } else {
                vocab.pad_a()
            };
            continue;
        }

        let (offset, width) = segments[stream];
        let stream_logits = logits.narrow(D::Minus1, offset, width)?;
        let stream_logits = apply_repetition_penalty(
            &stream_logits,
            &state.history[stream],
            config.repetition_penalty,
        )?;
        *token = sampler.sample(&stream_logits, config)?;
    }

    if tokens[NUM_AUDIO_LAYERS - 1] == vocab.eoa() {
        state.audio_end = true;
    }
    if tokens[TEXT_STREAM] == vocab.eot() {
        state.text_end = true;
    }

    state.current = Some(tokens);
    let batch = state.attention_mask.dim(0)?;
    let one = Tensor::ones((batch, 1), state.attention_mask.dtype(), device)?;
    state.attention_mask = Tensor::cat(&[&state.attention_mask, &one], 1)?;
    state.steps += 1;

    if state.audio_end {
        return Ok(DecodeStatus::AudioEnded);
    }
    for (history, &token) in state.history.iter_mut().zip(tokens.iter()) {
        history.push(token);
    }
    Ok(state.status())
}

/// Generate the eight streams for one prompt
///
/// `prompt_embeds` is the merged prompt `[1, seq, hidden]`; `attention_mask`
/// is `[1, seq]` or `None` for an unpadded prompt.
pub fn generate<L: CausalLm>(
    lm: &L,
    vocab: &VocabConfig,
    prompt_embeds: &Tensor,
    attention_mask: Option<&Tensor>,
    config: &GenerationConfig,
) -> Result<GeneratedStreams> {
    let (batch, seq_len, _) = prompt_embeds.dims3()?;
    anyhow::ensure!(batch == 1, "parallel generation supports a single prompt, got {}", batch);

    let attention_mask = match attention_mask {
        Some(mask) => mask.clone(),
        None => Tensor::ones((1, seq_len), DType::U8, prompt_embeds.device())?,
    };

    tracing::info!(
        "Generating up to {} steps from a {}-position prompt (sampling: {})",
        config.max_new_tokens,
        seq_len,
        config.samples()
    );

    let mut state = DecodeState::new(lm.new_cache(), attention_mask);
    let mut sampler = Sampler::new(config.seed);

    for step in 0..config.max_new_tokens {
        let status = decode_step(lm, vocab, &mut state, prompt_embeds, config, &mut sampler)?;
        tracing::debug!(step, ?status, tokens = ?state.current, "decode step");
        if status == DecodeStatus::AudioEnded {
            break;
        }
    }

    let output = state.finish(vocab);
    tracing::info!(
        "Generation finished after {} steps ({}), {} text tokens",
        output.steps,
        if output.audio_ended { "end of audio" } else { "step budget" },
        output.text().len()
    );
    Ok(output)
}
