//! Sequence models behind one polymorphic interface.
//!
//! This module provides:
//! - The `SequenceModel` trait shared by every variant
//! - Character-level Markov chains (`MarkovModel`)
//! - Hidden Markov models trained with Baum-Welch (`HiddenMarkovModel`)
//! - Stacked recurrent networks, LSTM or GRU (`RecurrentModel`)

use clap::{CommandFactory, Parser};
use rand::RngCore;

use crate::error::Result;
use crate::samples::SampleSet;
use crate::training::{CancellationToken, StopReason, TrainStatus};

/// Hidden Markov model with a stop transition, fitted by Baum-Welch.
pub mod hmm;

/// Character-level Markov chain over a fixed byte history.
pub mod markov;

/// Stacked recurrent networks trained with minibatch SGD.
pub mod rnn;

/// A single Markov chain state and its transition counts.
mod state;

pub use state::{State, Transition};

/// Probability substituted for impossible transitions when measuring loss,
/// so the log-likelihood stays finite.
pub const ENTROPY_SOFTENER: f64 = 1e-5;

/// A trainable character-level language model.
///
/// Every variant can be trained on a [`SampleSet`], asked for new text
/// and serialized. Variant options are parsed from command-line style
/// arguments so a caller can drive any variant without knowing its type.
pub trait SequenceModel: Send {
	/// Short name used on the command line (`lstm`, `markov`, ...).
	fn name(&self) -> &'static str;

	/// Checkpoint type tag identifying the concrete variant.
	fn type_tag(&self) -> &'static str;

	/// Parses the variant's training flags.
	fn configure_training(&mut self, args: &[String]) -> Result<()>;

	/// Parses the variant's generation flags.
	fn configure_generation(&mut self, args: &[String]) -> Result<()>;

	fn training_usage(&self) -> String;

	fn generation_usage(&self) -> String;

	/// Whether the model holds learned (or loaded) parameters.
	fn is_trained(&self) -> bool;

	/// Fits the model to `samples`.
	///
	/// A validation fraction is held out with a stable hash split. Every
	/// random choice (initialisation, shuffles) is drawn from `rng`. Progress
	/// is reported to `on_status`; returning `false` from it ends training,
	/// as does cancelling `cancel`.
	fn train(
		&mut self,
		samples: &SampleSet,
		cancel: &CancellationToken,
		rng: &mut dyn RngCore,
		on_status: &mut dyn FnMut(&TrainStatus) -> bool,
	) -> Result<StopReason>;

	/// Produces at most `length` bytes.
	///
	/// # Errors
	/// Returns `InvalidState` if the model is untrained.
	fn generate(&mut self, length: usize, rng: &mut dyn RngCore) -> Result<Vec<u8>>;

	/// Variant payload, without the type tag.
	fn serialize(&self) -> Result<Vec<u8>>;
}

/// Parses `args` into a flag struct, using `name` as the program name in errors.
pub(crate) fn parse_flags<T: Parser>(name: &str, args: &[String]) -> Result<T> {
	let argv = std::iter::once(name).chain(args.iter().map(String::as_str));
	Ok(T::try_parse_from(argv)?)
}

/// Renders the help text of a flag struct.
pub(crate) fn flags_usage<T: CommandFactory>(name: &'static str) -> String {
	T::command().name(name).render_help().to_string()
}

/// Logs the split sizes the way every variant reports them.
pub(crate) fn log_split(training: &SampleSet, validation: &SampleSet) {
	log::info!("Training: {} samples ({} bytes)", training.len(), training.total_bytes());
	log::info!("Validation: {} samples ({} bytes)", validation.len(), validation.total_bytes());
}
