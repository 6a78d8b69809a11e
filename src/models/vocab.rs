//! Shared vocabulary layout for the text stream and the seven audio layers
//!
//! The language model sees one embedding table laid out as:
//!
//! ```text
//! [0, padded_text)                                   text tokens + text specials
//! [padded_text + i*padded_audio, +padded_audio)      audio layer i (i = 0..7)
//! ```
//!
//! Audio ids are stored per layer in their raw `[0, padded_audio)` range and
//! moved into their layer's region with [`VocabConfig::layershift`].

use serde::{Deserialize, Serialize};

/// Number of parallel audio codebook layers.
pub const NUM_AUDIO_LAYERS: usize = 7;

/// Total number of token streams (7 audio + 1 text).
pub const NUM_STREAMS: usize = NUM_AUDIO_LAYERS + 1;

/// Index of the text stream among the eight streams.
pub const TEXT_STREAM: usize = NUM_AUDIO_LAYERS;

/// Label value excluded from loss and accuracy.
pub const IGNORE_INDEX: i64 = -100;

/// Vocabulary layout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabConfig {
    /// Size of the pretrained text vocabulary
    #[serde(default = "default_text_vocabsize")]
    pub text_vocabsize: usize,

    /// Special tokens appended after the text vocabulary
    #[serde(default = "default_specialtokens")]
    pub text_specialtokens: usize,

    /// Codebook size of one audio layer
    #[serde(default = "default_audio_vocabsize")]
    pub audio_vocabsize: usize,

    /// Special tokens appended after each audio codebook
    #[serde(default = "default_specialtokens")]
    pub audio_specialtokens: usize,

    /// Number of audio layers
    #[serde(default = "default_code_layer")]
    pub code_layer: usize,
}

fn default_text_vocabsize() -> usize {
    151936
}

fn default_audio_vocabsize() -> usize {
    4096
}

fn default_specialtokens() -> usize {
    64
}

fn default_code_layer() -> usize {
    NUM_AUDIO_LAYERS
}

impl Default for VocabConfig {
    fn default() -> Self {
        Self {
            text_vocabsize: default_text_vocabsize(),
            text_specialtokens: default_specialtokens(),
            audio_vocabsize: default_audio_vocabsize(),
            audio_specialtokens: default_specialtokens(),
            code_layer: default_code_layer(),
        }
    }
}

impl VocabConfig {
    /// Create a layout with seven audio layers
    pub fn new(
        text_vocabsize: usize,
        text_specialtokens: usize,
        audio_vocabsize: usize,
        audio_specialtokens: usize,
    ) -> Self {
        Self {
            text_vocabsize,
            text_specialtokens,
            audio_vocabsize,
            audio_specialtokens,
            code_layer: NUM_AUDIO_LAYERS,
        }
    }

    /// Width of the text segment of the logits
    pub fn padded_text_vocabsize(&self) -> usize {
        self.text_vocabsize + self.text_specialtokens
    }

    /// Width of one audio segment of the logits
    pub fn padded_audio_vocabsize(&self) -> usize {
        self.audio_vocabsize + self.audio_specialtokens
    }

    /// Width of all audio segments together
    pub fn total_audio_vocabsize(&self) -> usize {
        self.padded_audio_vocabsize() * self.code_layer
    }

    /// Width of the resized embedding table and output projection
    pub fn total_vocabsize(&self) -> usize {
        self.padded_text_vocabsize() + self.total_audio_vocabsize()
    }

    /// End of text
    pub fn eot(&self) -> u32 {
        self.text_vocabsize as u32
    }

    /// Text padding, emitted once the text stream has ended
    pub fn pad_t(&self) -> u32 {
        self.text_vocabsize as u32 + 1
    }

    /// Marks text input
    pub fn input_t(&self) -> u32 {
        self.text_vocabsize as u32 + 2
    }

    /// Marks the start of the text answer
    pub fn answer_t(&self) -> u32 {
        self.text_vocabsize as u32 + 3
    }

    /// ASR task marker
    pub fn asr(&self) -> u32 {
        self.text_vocabsize as u32 + 4
    }

    /// End of audio
    pub fn eoa(&self) -> u32 {
        self.audio_vocabsize as u32
    }

    /// Audio padding, emitted once the audio streams have ended
    pub fn pad_a(&self) -> u32 {
        self.audio_vocabsize as u32 + 1
    }

    /// Marks audio input
    pub fn input_a(&self) -> u32 {
        self.audio_vocabsize as u32 + 2
    }

    /// Marks the start of the audio answer
    pub fn answer_a(&self) -> u32 {
        self.audio_vocabsize as u32 + 3
    }

    /// Separator token
    pub fn split(&self) -> u32 {
        self.audio_vocabsize as u32 + 4
    }

    /// Offset of audio layer `layer` inside the shared table
    pub fn audio_offset(&self, layer: usize) -> usize {
        self.padded_text_vocabsize() + layer * self.padded_audio_vocabsize()
    }

    /// Move a raw audio id of layer `layer` into its region of the shared table
    pub fn layershift(&self, token: u32, layer: usize) -> u32 {
        token + self.audio_offset(layer) as u32
    }

    /// `(offset, width)` of each logits segment, audio layers first, text last
    pub fn stream_segments(&self) -> [(usize, usize); NUM_STREAMS] {
        let audio = self.padded_audio_vocabsize();
        let mut segments = [(0, self.padded_text_vocabsize()); NUM_STREAMS];
        for (layer, segment) in segments.iter_mut().take(NUM_AUDIO_LAYERS).enumerate() {
            *segment = (self.audio_offset(layer), audio);
        }
        segments
    }

    /// Build the eight prompt streams for a text-input task
    ///
    /// The text stream carries `text_ids` followed by `answer_t`; each audio
    /// stream carries layer-shifted `pad_a` at every prompt position followed by
    /// layer-shifted `answer_a`. Returned in stream order (audio 0..7, text).
    pub fn text_prompt_streams(&self, text_ids: &[u32]) -> Vec<Vec<u32>> {
        let len = text_ids.len();
        let mut streams: Vec<Vec<u32>> = (0..NUM_AUDIO_LAYERS)
            .map(|layer| {
                let mut stream = vec![self.layershift(self.pad_a(), layer); len];
                stream.push(self.layershift(self.answer_a(), layer));
                stream
            })
            .collect();

        let mut text = text_ids.to_vec();
        text.push(self.answer_t());
        streams.push(text);
        streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let vocab = VocabConfig::default();
        assert_eq!(vocab.padded_text_vocabsize(), 152000);
        assert_eq!(vocab.padded_audio_vocabsize(), 4160);
        assert_eq!(vocab.total_vocabsize(), 181120);
        assert_eq!(vocab.eot(), 151936);
        assert_eq!(vocab.pad_t(), 151937);
        assert_eq!(vocab.eoa(), 4096);
        assert_eq!(vocab.pad_a(), 4097);
        assert_eq!(vocab.split(), 4100);
    }

    #[test]
    fn test_layershift_regions_are_disjoint() {
        let vocab = VocabConfig::new(90, 10, 40, 10);
        let last_id = vocab.padded_audio_vocabsize() as u32 - 1;
        for layer in 0..NUM_AUDIO_LAYERS - 1 {
            assert!(vocab.layershift(last_id, layer) < vocab.layershift(0, layer + 1));
        }
        assert_eq!(vocab.layershift(0, 0), 100);
        assert_eq!(vocab.layershift(3, 2), 100 + 2 * 50 + 3);
        assert_eq!(
            vocab.layershift(last_id, NUM_AUDIO_LAYERS - 1) as usize,
            vocab.total_vocabsize() - 1
        );
    }

    #[test]
    fn test_stream_segments() {
        let vocab = VocabConfig::new(90, 10, 40, 10);
        let segments = vocab.stream_segments();
        assert_eq!(segments[0], (100, 50));
        assert_eq!(segments[6], (400, 50));
        assert_eq!(segments[TEXT_STREAM], (0, 100));
    }

    #[test]
    fn test_text_prompt_streams() {
        let vocab = VocabConfig::new(90, 10, 40, 10);
        let streams = vocab.text_prompt_streams(&[5, 6, 7]);
        assert_eq!(streams.len(), NUM_STREAMS);
        for stream in &streams {
            assert_eq!(stream.len(), 4);
        }
        assert_eq!(streams[TEXT_STREAM], vec![5, 6, 7, vocab.answer_t()]);
        assert_eq!(streams[1][0], vocab.layershift(vocab.pad_a(), 1));
        assert_eq!(streams[1][3], vocab.layershift(vocab.answer_a(), 1));
    }

    #[test]
    fn test_vocab_config_deserialization_with_defaults() {
        let json = r#"{"text_vocabsize": 90, "text_specialtokens": 10}"#;
        let vocab: VocabConfig = serde_json::from_str(json).unwrap();
        assert_eq!(vocab.padded_text_vocabsize(), 100);
        assert_eq!(vocab.audio_vocabsize, 4096);
        assert_eq!(vocab.code_layer, 7);
    }
}
