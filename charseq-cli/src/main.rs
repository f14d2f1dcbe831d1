//! Command-line front end: train a model on a corpus directory, generate
//! text from a checkpoint, or print a variant's options.
//!
//! ```bash
//! charseq train lstm model.bin ./corpus --random-seed 7 --hidden 256 --max-iters 1000
//! charseq gen model.bin 200 --temperature 0.8 --seed "Once"
//! charseq help markov
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use charseq_core::samples::{CHUNK_SIZE_VAR, HEAD_ONLY_VAR};
use charseq_core::{CancellationToken, ChunkConfig, ModelRegistry, SampleStore, StopReason};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Parser, Debug)]
#[command(name = "charseq")]
#[command(about = "Character-level sequence models: train and generate", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Train a model, resuming from the checkpoint if it exists
	Train {
		/// Model variant (lstm, gru, markov, hmm)
		variant: String,
		/// Checkpoint file, read if present and always written
		checkpoint: PathBuf,
		/// Directory of training files
		corpus: PathBuf,
		/// Seed of the training RNG (random when omitted)
		#[arg(long)]
		random_seed: Option<u64>,
		/// Variant training flags
		#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
		flags: Vec<String>,
	},
	/// Generate text from a checkpoint
	Gen {
		checkpoint: PathBuf,
		/// Maximum number of bytes to generate
		length: usize,
		/// Seed of the sampling RNG (random when omitted)
		#[arg(long)]
		random_seed: Option<u64>,
		/// Variant generation flags
		#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
		flags: Vec<String>,
	},
	/// Show the flags of a variant, or list variants
	Help { variant: Option<String> },
}

fn main() -> Result<()> {
	env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

	let cli = Cli::parse();
	let registry = ModelRegistry::with_defaults();

	match cli.command {
		Command::Train { variant, checkpoint, corpus, random_seed, flags } => {
			train(&registry, &variant, checkpoint, corpus, random_seed, &flags)
		}
		Command::Gen { checkpoint, length, random_seed, flags } => generate(&registry, checkpoint, length, random_seed, &flags),
		Command::Help { variant } => help(&registry, variant.as_deref()),
	}
}

fn train(
	registry: &ModelRegistry,
	variant: &str,
	checkpoint: PathBuf,
	corpus: PathBuf,
	random_seed: Option<u64>,
	flags: &[String],
) -> Result<()> {
	let mut model = match registry
		.load_file(&checkpoint)
		.with_context(|| format!("Failed to load {}", checkpoint.display()))?
	{
		Some(model) => {
			if model.name() != variant {
				bail!("{} holds a {} model, not {}", checkpoint.display(), model.name(), variant);
			}
			info!("Loaded model from file.");
			model
		}
		None => {
			info!("Created new model.");
			registry.create(variant)?
		}
	};
	model.configure_training(flags)?;

	let store = SampleStore::new(ChunkConfig::from_env()?);
	let samples = store
		.load(&corpus)
		.with_context(|| format!("Failed to read samples from {}", corpus.display()))?;

	let cancel = CancellationToken::new();
	let handler_token = cancel.clone();
	ctrlc::set_handler(move || handler_token.cancel()).context("Failed to install the interrupt handler")?;

	let mut rng = seeded_rng(random_seed);
	let reason = model.train(&samples, &cancel, &mut rng, &mut |_| true)?;
	match reason {
		StopReason::Interrupted => info!("Caught interrupt, saving model..."),
		StopReason::NoSamples => warn!("No training samples in {}", corpus.display()),
		StopReason::Stopped | StopReason::Finished => (),
	}

	if model.is_trained() {
		registry
			.save_file(model.as_ref(), &checkpoint)
			.with_context(|| format!("Failed to save {}", checkpoint.display()))?;
	} else {
		warn!("Nothing was learned, {} left untouched", checkpoint.display());
	}
	Ok(())
}

fn generate(
	registry: &ModelRegistry,
	checkpoint: PathBuf,
	length: usize,
	random_seed: Option<u64>,
	flags: &[String],
) -> Result<()> {
	let mut model = registry
		.load_file(&checkpoint)
		.with_context(|| format!("Failed to load {}", checkpoint.display()))?
		.with_context(|| format!("No checkpoint at {}", checkpoint.display()))?;
	model.configure_generation(flags)?;

	let mut rng = seeded_rng(random_seed);
	let output = model.generate(length, &mut rng)?;

	let mut stdout = std::io::stdout().lock();
	stdout.write_all(&output)?;
	stdout.write_all(b"\n")?;
	Ok(())
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
	match seed {
		Some(seed) => StdRng::seed_from_u64(seed),
		None => StdRng::from_os_rng(),
	}
}

fn help(registry: &ModelRegistry, variant: Option<&str>) -> Result<()> {
	let Some(name) = variant else {
		println!("Available models: {}", registry.names().join(", "));
		println!();
		println!("Environment:");
		println!("  {CHUNK_SIZE_VAR}       bytes per training sample (default 1024)");
		println!("  {HEAD_ONLY_VAR}  non-empty to keep only the first chunk of each file");
		return Ok(());
	};

	let model = registry.create(name)?;
	println!("Training flags for {name}:\n{}", model.training_usage());
	println!("Generation flags for {name}:\n{}", model.generation_usage());
	Ok(())
}
