use clap::Parser;
use gemma_rs::{GemmaForCausalLM, SamplingParams, Tokenizer, VocabTokenizer, generate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Generate text with a Gemma checkpoint
#[derive(Parser, Debug)]
#[command(name = "gemma-rs")]
#[command(version)]
struct Args {
    /// Model config JSON
    #[arg(long)]
    config: PathBuf,

    /// Safetensors file or directory of shards
    #[arg(long)]
    checkpoint: PathBuf,

    /// Tokenizer vocabulary file
    #[arg(long)]
    tokenizer: PathBuf,

    /// Prompt text; repeat for a batch
    #[arg(short, long, required = true)]
    prompt: Vec<String>,

    /// Maximum number of tokens to generate per prompt
    #[arg(long, default_value_t = 100)]
    output_len: usize,

    /// Sampling temperature, 0 = greedy
    #[arg(long, default_value_t = 0.95)]
    temperature: f32,

    #[arg(long, default_value_t = 1.0)]
    top_p: f32,

    #[arg(long, default_value_t = 100)]
    top_k: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let model = GemmaForCausalLM::load(&args.config, &args.checkpoint)?;
    let tokenizer = VocabTokenizer::load(&args.tokenizer, model.config().vocab_size)?;
    info!(vocab = tokenizer.vocab_size(), eos = tokenizer.eos_id(), "loaded tokenizer");

    let sampling = SamplingParams::new(Some(args.temperature), args.top_p, args.top_k);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let prompts: Vec<&str> = args.prompt.iter().map(String::as_str).collect();
    let outputs = generate(
        &model,
        &tokenizer,
        &prompts,
        args.output_len,
        sampling,
        &mut rng,
    )?;

    for (prompt, output) in prompts.iter().zip(&outputs) {
        println!("{}", "=".repeat(50));
        println!("PROMPT: {prompt}");
        println!("RESULT: {output}");
    }
    println!("{}", "=".repeat(50));
    Ok(())
}
