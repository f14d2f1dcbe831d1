use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;

use clap::Parser;
use log::info;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::state::{State, Transition};
use super::{ENTROPY_SOFTENER, SequenceModel, flags_usage, log_split, parse_flags};
use crate::error::{ModelError, Result};
use crate::samples::{Sample, SampleSet};
use crate::training::{CancellationToken, StopReason, TrainStatus};

/// Checkpoint type tag of [`MarkovModel`].
pub const MARKOV_TYPE: &str = "charseq.Markov";

/// Training options of a Markov chain.
#[derive(Parser, Clone, Debug, PartialEq)]
pub struct MarkovTrainingFlags {
	/// Character history size
	#[arg(long, default_value_t = 3)]
	pub history: usize,

	/// Validation fraction
	#[arg(long, default_value_t = 0.1)]
	pub validation: f64,
}

impl Default for MarkovTrainingFlags {
	fn default() -> Self {
		Self { history: 3, validation: 0.1 }
	}
}

/// The Markov chain takes no generation option.
#[derive(Parser, Clone, Debug, Default, PartialEq)]
pub struct MarkovGenerationFlags {}

/// Character-level Markov chain.
///
/// Every state is keyed by the last `history` bytes (fewer at the start
/// of a sample) and counts the bytes that followed it, plus how often a
/// sample ended there.
///
/// # Invariants
/// - Each state in `states` is keyed by a history of at most `history` bytes
/// - All stored transition counts are >= 1
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MarkovModel {
	history: usize,
	states: BTreeMap<Vec<u8>, State>,

	#[serde(skip)]
	pub flags: MarkovTrainingFlags,
}

impl MarkovModel {
	/// Creates an empty chain over `history` bytes of context.
	pub fn new(history: usize) -> Self {
		Self { history, states: BTreeMap::new(), flags: MarkovTrainingFlags { history, ..Default::default() } }
	}

	pub fn deserialize(bytes: &[u8]) -> Result<Self> {
		postcard::from_bytes(bytes).map_err(|e| ModelError::Deserialization(format!("markov: {e}")))
	}

	pub fn history(&self) -> usize {
		self.history
	}

	/// The state for a history, if it was ever observed.
	pub fn state(&self, history: &[u8]) -> Option<&State> {
		self.states.get(history)
	}

	pub fn states(&self) -> impl Iterator<Item = &State> {
		self.states.values()
	}

	/// Counts every transition of `sample`, including the final one to the end.
	pub fn add_sample(&mut self, sample: &[u8]) {
		let mut key = Vec::with_capacity(self.history + 1);
		let transitions = sample.iter().map(|&b| Transition::Byte(b)).chain([Transition::End]);

		for transition in transitions {
			let state = self.states.entry(key.clone()).or_insert_with(|| State::new(&key));
			state.add_transition(transition);

			if let Transition::Byte(b) = transition {
				self.push_history(&mut key, b);
			}
		}
	}

	/// Merges another chain into this one.
	///
	/// # Errors
	/// Returns an error if the histories do not match.
	pub fn merge(&mut self, other: &Self) -> Result<()> {
		if self.history != other.history {
			return Err(ModelError::InvalidState("History mismatch".to_owned()));
		}

		for (key, state) in &other.states {
			if let Some(existing) = self.states.get_mut(key) {
				existing.merge(state).map_err(ModelError::InvalidState)?;
			} else {
				self.states.insert(key.clone(), state.clone());
			}
		}

		Ok(())
	}

	/// Builds a chain from `samples`, counting partial chains on every core
	/// and merging them.
	pub fn build(history: usize, samples: &[Sample]) -> Result<Self> {
		let mut final_model = MarkovModel::new(history);
		if samples.is_empty() {
			return Ok(final_model);
		}

		let chunks = num_cpus::get() * 8;
		let chunk_size = samples.len().div_ceil(chunks);

		let (tx, rx) = mpsc::channel();
		thread::scope(|scope| {
			for chunk in samples.chunks(chunk_size) {
				let tx = tx.clone();
				scope.spawn(move || {
					let mut partial_model = MarkovModel::new(history);
					for sample in chunk {
						partial_model.add_sample(sample);
					}
					let _ = tx.send(partial_model);
				});
			}
		});
		drop(tx);

		for partial_model in rx.iter() {
			final_model.merge(&partial_model)?;
		}
		Ok(final_model)
	}

	/// Mean negative log-likelihood per byte of `samples`.
	///
	/// Unseen transitions count with probability [`ENTROPY_SOFTENER`].
	/// Returns `None` when there are no bytes to score.
	pub fn mean_loss(&self, samples: &SampleSet) -> Option<f64> {
		let bytes = samples.total_bytes();
		if bytes == 0 {
			return None;
		}
		let total: f64 = samples.iter().map(|s| self.sample_loss(s)).sum();
		Some(total / bytes as f64)
	}

	fn sample_loss(&self, sample: &[u8]) -> f64 {
		let mut key = Vec::with_capacity(self.history + 1);
		let mut entropy = 0.0;

		for &b in sample {
			let p = self
				.states
				.get(&key)
				.map(|s| s.probability(Transition::Byte(b)))
				.unwrap_or(0.0);
			entropy += if p == 0.0 { ENTROPY_SOFTENER.ln() } else { p.ln() };
			self.push_history(&mut key, b);
		}
		-entropy
	}

	fn push_history(&self, key: &mut Vec<u8>, b: u8) {
		key.push(b);
		if key.len() > self.history {
			key.remove(0);
		}
	}
}

impl SequenceModel for MarkovModel {
	fn name(&self) -> &'static str {
		"markov"
	}

	fn type_tag(&self) -> &'static str {
		MARKOV_TYPE
	}

	fn configure_training(&mut self, args: &[String]) -> Result<()> {
		self.flags = parse_flags(self.name(), args)?;
		Ok(())
	}

	fn configure_generation(&mut self, args: &[String]) -> Result<()> {
		let _: MarkovGenerationFlags = parse_flags(self.name(), args)?;
		Ok(())
	}

	fn training_usage(&self) -> String {
		flags_usage::<MarkovTrainingFlags>("markov")
	}

	fn generation_usage(&self) -> String {
		flags_usage::<MarkovGenerationFlags>("markov")
	}

	fn is_trained(&self) -> bool {
		!self.states.is_empty()
	}

	/// Rebuilds the chain from scratch with the configured history.
	fn train(
		&mut self,
		samples: &SampleSet,
		cancel: &CancellationToken,
		_rng: &mut dyn RngCore,
		on_status: &mut dyn FnMut(&TrainStatus) -> bool,
	) -> Result<StopReason> {
		let (validation, training) = samples.hash_split(self.flags.validation);
		log_split(&training, &validation);
		if cancel.is_cancelled() {
			return Ok(StopReason::Interrupted);
		}

		info!("Producing chain...");
		let flags = self.flags.clone();
		*self = Self::build(flags.history, training.as_slice())?;
		self.flags = flags;

		info!("Computing cross-entropy...");
		let status = TrainStatus {
			iteration: 0,
			train_loss: self.mean_loss(&training).unwrap_or(0.0),
			validation_loss: self.mean_loss(&validation),
		};
		status.log();
		on_status(&status);

		Ok(StopReason::Finished)
	}

	/// Walks the chain from the empty history until the end transition,
	/// an unknown history or `length` bytes.
	fn generate(&mut self, length: usize, rng: &mut dyn RngCore) -> Result<Vec<u8>> {
		if !self.is_trained() {
			return Err(ModelError::InvalidState("markov chain has not been trained".to_owned()));
		}

		let mut output = Vec::new();
		let mut key = Vec::with_capacity(self.history + 1);
		while output.len() < length {
			let next = match self.states.get(&key) {
				Some(state) => state.predict(rng),
				None => None,
			};
			match next {
				Some(Transition::Byte(b)) => {
					output.push(b);
					self.push_history(&mut key, b);
				}
				_ => break,
			}
		}
		Ok(output)
	}

	fn serialize(&self) -> Result<Vec<u8>> {
		postcard::to_stdvec(self).map_err(|e| ModelError::Serialization(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	#[test]
	fn history_window_slides() {
		let mut model = MarkovModel::new(2);
		model.add_sample(b"abcd");

		assert_eq!(model.state(b"").unwrap().count(Transition::Byte(b'a')), 1);
		assert_eq!(model.state(b"a").unwrap().count(Transition::Byte(b'b')), 1);
		assert_eq!(model.state(b"ab").unwrap().count(Transition::Byte(b'c')), 1);
		assert_eq!(model.state(b"bc").unwrap().count(Transition::Byte(b'd')), 1);
		assert_eq!(model.state(b"cd").unwrap().count(Transition::End), 1);
		assert!(model.state(b"abc").is_none());
	}

	#[test]
	fn parallel_build_matches_sequential_counts() {
		let samples = SampleSet::from_bytes((0..100).map(|i| format!("the {i} cat sat")));
		let built = MarkovModel::build(2, samples.as_slice()).unwrap();

		let mut sequential = MarkovModel::new(2);
		for s in samples.iter() {
			sequential.add_sample(s);
		}
		assert_eq!(built.states, sequential.states);
	}

	#[test]
	fn merge_rejects_different_histories() {
		let mut a = MarkovModel::new(1);
		assert!(a.merge(&MarkovModel::new(2)).is_err());
	}

	#[test]
	fn loss_uses_softener_for_unseen_bytes() {
		let mut model = MarkovModel::new(1);
		model.add_sample(b"ab");
		let loss = model.mean_loss(&SampleSet::from_bytes([b"z"])).unwrap();
		assert!((loss + ENTROPY_SOFTENER.ln()).abs() < 1e-12);
		assert!(model.mean_loss(&SampleSet::default()).is_none());
	}

	#[test]
	fn generation_follows_a_deterministic_chain() {
		let mut model = MarkovModel::new(3);
		model.add_sample(b"hello");
		let mut rng = StdRng::seed_from_u64(1);
		assert_eq!(model.generate(100, &mut rng).unwrap(), b"hello");
		assert_eq!(model.generate(3, &mut rng).unwrap(), b"hel");
	}

	#[test]
	fn untrained_chain_cannot_generate() {
		let mut model = MarkovModel::new(3);
		let err = model.generate(10, &mut StdRng::seed_from_u64(1)).unwrap_err();
		assert!(matches!(err, ModelError::InvalidState(_)));
	}
}
