//! Tokenization for the text stream

mod text;

pub use text::TextTokenizer;
