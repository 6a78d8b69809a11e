//! Generate parallel text + audio streams from a text prompt
//!
//! Expects a model directory with `config.json`, `tokenizer.json` and
//! optionally `model.safetensors` (random weights otherwise).

use anyhow::Result;
use candle_core::DType;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use slam_s2s::{
    device_info, load_qwen_s2s, parse_device, GenerationConfig, ModelConfig, S2SBatch,
    S2SComponents, TextTokenizer, TrainConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate text + audio token streams from a text prompt")]
struct Args {
    /// Text prompt
    #[arg(short, long)]
    text: String,

    /// Model directory
    #[arg(short, long, default_value = "test_data/model")]
    model_dir: String,

    /// JSON file with generation options; flags below override it
    #[arg(long)]
    generation_config: Option<PathBuf>,

    /// Maximum number of decode steps
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Sample instead of greedy decoding
    #[arg(long)]
    do_sample: bool,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f64>,

    /// Repetition penalty
    #[arg(long)]
    repetition_penalty: Option<f64>,

    /// Random seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Device: auto, cpu, cuda, cuda:N, metal
    #[arg(long, default_value = "auto")]
    device: String,

    /// Write the generated streams as JSON here
    #[arg(short, long, default_value = "s2s_output.json")]
    output: PathBuf,
}

impl Args {
    fn generation_config(&self) -> Result<GenerationConfig> {
        let mut config = match &self.generation_config {
            Some(path) => GenerationConfig::from_file(path)?,
            None => GenerationConfig::default(),
        };
        if let Some(max_new_tokens) = self.max_new_tokens {
            config.max_new_tokens = max_new_tokens;
        }
        if self.do_sample {
            config.do_sample = true;
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(penalty) = self.repetition_penalty {
            config.repetition_penalty = penalty;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let device = parse_device(&args.device)?;
    let generation_config = args.generation_config()?;
    println!("Device: {}", device_info(&device));
    println!("Model:  {}", args.model_dir);
    println!("Text:   {}", args.text);

    let model_config = ModelConfig::from_pretrained(&args.model_dir)?;
    let tokenizer = TextTokenizer::from_pretrained(&args.model_dir)?;

    let weights = Path::new(&args.model_dir).join("model.safetensors");
    let weights = if weights.exists() {
        Some(weights)
    } else {
        tracing::warn!("No model.safetensors in {}, using random weights", args.model_dir);
        None
    };

    let loaded = load_qwen_s2s(
        model_config,
        TrainConfig::default(),
        weights.as_deref(),
        S2SComponents::default(),
        DType::F32,
        &device,
    )?;
    let model = loaded.model;

    let text_ids = tokenizer.encode(&args.text)?;
    let prompt = S2SBatch::text_prompt(model.vocab(), &text_ids, &device)?;
    let generated = model.generate(&prompt, &generation_config)?;

    let text = tokenizer.decode_text_stream(generated.text(), model.vocab())?;
    println!("\nGenerated {} steps", generated.steps);
    println!("Text: {}", text);

    let report = serde_json::json!({
        "prompt": args.text,
        "text": text,
        "steps": generated.steps,
        "audio_ended": generated.audio_ended,
        "streams": generated.streams,
    });
    std::fs::write(&args.output, serde_json::to_string_pretty(&report)?)?;
    println!("Streams written to {}", args.output.display());

    Ok(())
}
