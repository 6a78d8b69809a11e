//! Optional neural codec turning generated audio codes into a waveform

use anyhow::Result;
use candle_core::{Device, Tensor};

use super::vocab::NUM_AUDIO_LAYERS;

/// Codec decoder over the seven raw audio code layers
pub trait CodecDecoder {
    /// Output sample rate in Hz
    fn sample_rate(&self) -> u32;

    /// Decode codes `[7, frames]` (raw per-layer ids, not layer-shifted) into
    /// a mono waveform `[samples]`
    fn decode(&self, codes: &Tensor) -> Result<Tensor>;
}

/// Stack the seven generated audio streams into `[7, frames]`
///
/// Streams are cut to the shortest one, and again at the first frame where
/// any layer holds an id outside the codebook (end-of-audio, padding), so the
/// layers stay aligned.
pub fn stack_audio_codes(
    audio_streams: &[Vec<u32>],
    codebook_size: u32,
    device: &Device,
) -> Result<Tensor> {
    anyhow::ensure!(
        audio_streams.len() == NUM_AUDIO_LAYERS,
        "expected {} audio streams, got {}",
        NUM_AUDIO_LAYERS,
        audio_streams.len()
    );
    let shortest = audio_streams.iter().map(Vec::len).min().unwrap_or(0);
    let frames = (0..shortest)
        .find(|&t| audio_streams.iter().any(|stream| stream[t] >= codebook_size))
        .unwrap_or(shortest);
    anyhow::ensure!(frames > 0, "no audio frames to decode");

    let flat: Vec<u32> = audio_streams
        .iter()
        .flat_map(|stream| stream[..frames].iter().copied())
        .collect();
    Ok(Tensor::new(flat.as_slice(), device)?.reshape((NUM_AUDIO_LAYERS, frames))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_audio_codes_aligns_layers() {
        let device = Device::Cpu;
        let mut streams: Vec<Vec<u32>> = (0..NUM_AUDIO_LAYERS as u32).map(|l| vec![l; 4]).collect();
        streams[3].truncate(2);
        let codes = stack_audio_codes(&streams, 100, &device).unwrap();
        assert_eq!(codes.dims(), &[7, 2]);
        let rows: Vec<Vec<u32>> = codes.to_vec2().unwrap();
        assert_eq!(rows[5], vec![5, 5]);
    }

    #[test]
    fn test_stack_audio_codes_stops_at_special_ids() {
        let device = Device::Cpu;
        let mut streams: Vec<Vec<u32>> = vec![vec![1, 2, 3, 4]; NUM_AUDIO_LAYERS];
        streams[6][2] = 40;
        let codes = stack_audio_codes(&streams, 40, &device).unwrap();
        assert_eq!(codes.dims(), &[7, 2]);
    }

    #[test]
    fn test_stack_audio_codes_rejects_empty() {
        let device = Device::Cpu;
        let streams = vec![Vec::new(); NUM_AUDIO_LAYERS];
        assert!(stack_audio_codes(&streams, 40, &device).is_err());
        assert!(stack_audio_codes(&streams[..3], 40, &device).is_err());
    }
}
