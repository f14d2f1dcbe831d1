use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;

use clap::Parser;
use log::info;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::{ENTROPY_SOFTENER, SequenceModel, flags_usage, log_split, parse_flags};
use crate::decoder::sample_weighted;
use crate::error::{ModelError, Result};
use crate::samples::{Sample, SampleSet};
use crate::training::{CancellationToken, StopReason, TrainStatus};

/// Checkpoint type tag of [`HiddenMarkovModel`].
pub const HMM_TYPE: &str = "charseq.HMM";

/// Number of observable symbols (every byte value).
pub const OBS_COUNT: usize = 256;

/// Training options of a hidden Markov model.
#[derive(Parser, Clone, Debug, PartialEq)]
pub struct HmmTrainingFlags {
	/// Number of hidden states
	#[arg(long, default_value_t = 200)]
	pub states: usize,

	/// Validation fraction
	#[arg(long, default_value_t = 0.1)]
	pub validation: f64,

	/// Baum-Welch iterations to run (0 = until interrupted)
	#[arg(long, default_value_t = 0)]
	pub max_iters: usize,
}

impl Default for HmmTrainingFlags {
	fn default() -> Self {
		Self { states: 200, validation: 0.1, max_iters: 0 }
	}
}

/// The HMM takes no generation option.
#[derive(Parser, Clone, Debug, Default, PartialEq)]
pub struct HmmGenerationFlags {}

/// Character-level hidden Markov model.
///
/// `N` emitting states share one observation alphabet of [`OBS_COUNT`]
/// bytes. Transitions are stored row-major as an `N x (N+1)` matrix whose
/// last column is the probability of stopping, which ends a sequence.
///
/// # Invariants
/// - `initial.len() == N`, `transitions.len() == N * (N + 1)`,
///   `emissions.len() == N * OBS_COUNT`
/// - Every row is a probability distribution
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HiddenMarkovModel {
	num_states: usize,
	initial: Vec<f64>,
	transitions: Vec<f64>,
	emissions: Vec<f64>,

	#[serde(skip)]
	pub flags: HmmTrainingFlags,
}

/// Expected counts gathered by the E-step of Baum-Welch.
#[derive(Clone, Debug)]
struct Statistics {
	initial: Vec<f64>,
	transitions: Vec<f64>,
	emissions: Vec<f64>,
}

impl Statistics {
	fn new(n: usize) -> Self {
		Self { initial: vec![0.0; n], transitions: vec![0.0; n * (n + 1)], emissions: vec![0.0; n * OBS_COUNT] }
	}

	fn merge(&mut self, other: &Self) {
		add_into(&mut self.initial, &other.initial);
		add_into(&mut self.transitions, &other.transitions);
		add_into(&mut self.emissions, &other.emissions);
	}
}

/// Scaled forward pass of one sequence.
struct Forward {
	/// `T x N`, each row normalised to 1.
	alphas: Vec<f64>,
	/// Per-step normalisers; their product times `end` is the likelihood.
	scales: Vec<f64>,
	/// Probability of stopping after the last step, given the last alpha.
	end: f64,
}

impl HiddenMarkovModel {
	/// Builds a model from explicit parameters.
	///
	/// Rows are renormalised; a row without mass becomes uniform.
	///
	/// # Errors
	/// Returns `InvalidOption` on inconsistent sizes or negative entries.
	pub fn from_parameters(initial: Vec<f64>, transitions: Vec<f64>, emissions: Vec<f64>) -> Result<Self> {
		let mut model = Self { num_states: initial.len(), initial, transitions, emissions, flags: Default::default() };
		model.validate().map_err(ModelError::InvalidOption)?;
		model.normalize_rows();
		Ok(model)
	}

	/// Random model with `num_states` states and strictly positive parameters.
	pub fn random<R: Rng + ?Sized>(num_states: usize, rng: &mut R) -> Result<Self> {
		if num_states == 0 {
			return Err(ModelError::InvalidOption("states must be >= 1".to_owned()));
		}
		let n = num_states;
		let mut draw = |len: usize| (0..len).map(|_| rng.random::<f64>() + 0.01).collect::<Vec<f64>>();
		let initial = draw(n);
		let transitions = draw(n * (n + 1));
		let emissions = draw(n * OBS_COUNT);
		Self::from_parameters(initial, transitions, emissions)
	}

	pub fn deserialize(bytes: &[u8]) -> Result<Self> {
		let model: Self = postcard::from_bytes(bytes).map_err(|e| ModelError::Deserialization(format!("hmm: {e}")))?;
		model.validate().map_err(|e| ModelError::Deserialization(format!("hmm: {e}")))?;
		Ok(model)
	}

	pub fn num_states(&self) -> usize {
		self.num_states
	}

	pub fn initial(&self, i: usize) -> f64 {
		self.initial[i]
	}

	/// Probability of moving from state `i` to state `j`.
	pub fn transition(&self, i: usize, j: usize) -> f64 {
		self.transitions[i * (self.num_states + 1) + j]
	}

	/// Probability of stopping after state `i`.
	pub fn stop(&self, i: usize) -> f64 {
		self.transitions[i * (self.num_states + 1) + self.num_states]
	}

	pub fn emission(&self, i: usize, obs: u8) -> f64 {
		self.emissions[i * OBS_COUNT + obs as usize]
	}

	fn validate(&self) -> std::result::Result<(), String> {
		let n = self.num_states;
		if self.initial.len() != n || self.transitions.len() != n * (n + 1) || self.emissions.len() != n * OBS_COUNT {
			return Err(format!(
				"inconsistent sizes for {} states: initial={} transitions={} emissions={}",
				n,
				self.initial.len(),
				self.transitions.len(),
				self.emissions.len()
			));
		}
		let mut all = self.initial.iter().chain(&self.transitions).chain(&self.emissions);
		if all.any(|&p| !p.is_finite() || p < 0.0) {
			return Err("parameters must be finite and non-negative".to_owned());
		}
		Ok(())
	}

	fn normalize_rows(&mut self) {
		let n = self.num_states;
		normalize(&mut self.initial);
		for row in self.transitions.chunks_mut(n + 1) {
			normalize(row);
		}
		for row in self.emissions.chunks_mut(OBS_COUNT) {
			normalize(row);
		}
	}

	/// Scaled forward recursion. `None` if the sequence is empty or impossible.
	fn forward(&self, seq: &[u8]) -> Option<Forward> {
		let n = self.num_states;
		let steps = seq.len();
		if steps == 0 {
			return None;
		}

		let mut alphas = vec![0.0; steps * n];
		let mut scales = vec![0.0; steps];

		for i in 0..n {
			alphas[i] = self.initial[i] * self.emission(i, seq[0]);
		}
		scales[0] = normalize_positive(&mut alphas[..n])?;

		for t in 1..steps {
			let (done, rest) = alphas.split_at_mut(t * n);
			let prev = &done[(t - 1) * n..];
			let cur = &mut rest[..n];
			for (j, cell) in cur.iter_mut().enumerate() {
				let mass: f64 = prev.iter().enumerate().map(|(i, a)| a * self.transition(i, j)).sum();
				*cell = mass * self.emission(j, seq[t]);
			}
			scales[t] = normalize_positive(cur)?;
		}

		let last = &alphas[(steps - 1) * n..];
		let end: f64 = last.iter().enumerate().map(|(i, a)| a * self.stop(i)).sum();
		if end <= 0.0 {
			return None;
		}
		Some(Forward { alphas, scales, end })
	}

	/// Adds the expected counts of `seq` to `stats`.
	///
	/// Returns `false` (and adds nothing) for impossible sequences.
	fn accumulate(&self, seq: &[u8], stats: &mut Statistics) -> bool {
		let Some(fwd) = self.forward(seq) else {
			return false;
		};
		let n = self.num_states;
		let steps = seq.len();

		let mut betas = vec![0.0; steps * n];
		for i in 0..n {
			betas[(steps - 1) * n + i] = self.stop(i) / fwd.end;
		}
		for t in (0..steps - 1).rev() {
			let scale = fwd.scales[t + 1];
			for i in 0..n {
				let mut sum = 0.0;
				for j in 0..n {
					sum += self.transition(i, j) * self.emission(j, seq[t + 1]) * betas[(t + 1) * n + j];
				}
				betas[t * n + i] = sum / scale;
			}
		}

		for (t, &obs) in seq.iter().enumerate() {
			for i in 0..n {
				let gamma = fwd.alphas[t * n + i] * betas[t * n + i];
				stats.emissions[i * OBS_COUNT + obs as usize] += gamma;
				if t == 0 {
					stats.initial[i] += gamma;
				}
			}
		}

		for t in 0..steps - 1 {
			let scale = fwd.scales[t + 1];
			for i in 0..n {
				let alpha = fwd.alphas[t * n + i];
				for j in 0..n {
					let xi = alpha * self.transition(i, j) * self.emission(j, seq[t + 1]) * betas[(t + 1) * n + j] / scale;
					stats.transitions[i * (n + 1) + j] += xi;
				}
			}
		}

		for i in 0..n {
			stats.transitions[i * (n + 1) + n] += fwd.alphas[(steps - 1) * n + i] * self.stop(i) / fwd.end;
		}
		true
	}

	/// Log-likelihood of `seq` including the final stop transition.
	///
	/// Impossible observations contribute `ln(ENTROPY_SOFTENER)` and the
	/// recursion carries on from the predicted state distribution.
	pub fn log_likelihood(&self, seq: &[u8]) -> f64 {
		let n = self.num_states;
		let mut alpha = self.initial.clone();
		let mut total = 0.0;

		for (t, &obs) in seq.iter().enumerate() {
			let predicted: Vec<f64> = if t == 0 {
				self.initial.clone()
			} else {
				(0..n)
					.map(|j| alpha.iter().enumerate().map(|(i, a)| a * self.transition(i, j)).sum())
					.collect()
			};

			let mut next: Vec<f64> = predicted.iter().enumerate().map(|(j, p)| p * self.emission(j, obs)).collect();
			match normalize_positive(&mut next) {
				Some(scale) => {
					total += scale.ln();
					alpha = next;
				}
				None => {
					total += ENTROPY_SOFTENER.ln();
					alpha = predicted;
					if normalize_positive(&mut alpha).is_none() {
						alpha = vec![1.0 / n as f64; n];
					}
				}
			}
		}

		let end: f64 = alpha.iter().enumerate().map(|(i, a)| a * self.stop(i)).sum();
		total + if end > 0.0 { end.ln() } else { ENTROPY_SOFTENER.ln() }
	}

	/// Mean negative log-likelihood per symbol, counting one stop symbol
	/// per sample.
	///
	/// Samples are scored on a pool of worker threads, one per core, which
	/// add into a shared running sum. Returns `None` for an empty set.
	pub fn mean_loss(&self, samples: &SampleSet) -> Option<f64> {
		if samples.is_empty() {
			return None;
		}

		let running = Mutex::new((0.0f64, 0usize));
		let next = AtomicUsize::new(0);
		let workers = num_cpus::get().min(samples.len()).max(1);

		thread::scope(|scope| {
			for _ in 0..workers {
				scope.spawn(|| {
					while let Some(sample) = samples.get(next.fetch_add(1, Ordering::Relaxed)) {
						let loss = -self.log_likelihood(sample);
						let mut guard = running.lock().unwrap_or_else(|e| e.into_inner());
						guard.0 += loss;
						// Add 1 for the terminal symbol.
						guard.1 += sample.len() + 1;
					}
				});
			}
		});

		let (total, divisor) = running.into_inner().unwrap_or_else(|e| e.into_inner());
		Some(total / divisor as f64)
	}

	/// One Baum-Welch iteration over `samples`.
	///
	/// The E-step runs on every core, each worker collecting statistics
	/// for its share of the samples; the partial statistics are merged
	/// before re-estimating the parameters. Returns how many samples
	/// contributed (impossible samples are skipped).
	pub fn baum_welch(&mut self, samples: &[Sample]) -> usize {
		let n = self.num_states;
		if samples.is_empty() || n == 0 {
			return 0;
		}

		let chunk_size = samples.len().div_ceil(num_cpus::get());
		let (tx, rx) = mpsc::channel();
		let model = &*self;
		thread::scope(|scope| {
			for (index, chunk) in samples.chunks(chunk_size).enumerate() {
				let tx = tx.clone();
				scope.spawn(move || {
					let mut stats = Statistics::new(n);
					let used = chunk.iter().filter(|s| model.accumulate(s, &mut stats)).count();
					let _ = tx.send((index, stats, used));
				});
			}
		});
		drop(tx);

		// Merged in chunk order so the sums do not depend on thread timing.
		let mut partials: Vec<_> = rx.iter().collect();
		partials.sort_by_key(|(index, _, _)| *index);

		let mut total = Statistics::new(n);
		let mut used = 0;
		for (_, stats, count) in &partials {
			total.merge(stats);
			used += count;
		}

		copy_normalized(&mut self.initial, &total.initial);
		for (row, counts) in self.transitions.chunks_mut(n + 1).zip(total.transitions.chunks(n + 1)) {
			copy_normalized(row, counts);
		}
		for (row, counts) in self.emissions.chunks_mut(OBS_COUNT).zip(total.emissions.chunks(OBS_COUNT)) {
			copy_normalized(row, counts);
		}
		used
	}
}

impl SequenceModel for HiddenMarkovModel {
	fn name(&self) -> &'static str {
		"hmm"
	}

	fn type_tag(&self) -> &'static str {
		HMM_TYPE
	}

	fn configure_training(&mut self, args: &[String]) -> Result<()> {
		self.flags = parse_flags(self.name(), args)?;
		Ok(())
	}

	fn configure_generation(&mut self, args: &[String]) -> Result<()> {
		let _: HmmGenerationFlags = parse_flags(self.name(), args)?;
		Ok(())
	}

	fn training_usage(&self) -> String {
		flags_usage::<HmmTrainingFlags>("hmm")
	}

	fn generation_usage(&self) -> String {
		flags_usage::<HmmGenerationFlags>("hmm")
	}

	fn is_trained(&self) -> bool {
		self.num_states > 0
	}

	fn train(
		&mut self,
		samples: &SampleSet,
		cancel: &CancellationToken,
		rng: &mut dyn RngCore,
		on_status: &mut dyn FnMut(&TrainStatus) -> bool,
	) -> Result<StopReason> {
		let (validation, training) = samples.hash_split(self.flags.validation);
		log_split(&training, &validation);

		if training.is_empty() {
			return Ok(StopReason::NoSamples);
		}

		if self.num_states == 0 {
			let flags = self.flags.clone();
			*self = Self::random(flags.states, rng)?;
			self.flags = flags;
		}

		info!("Computing initial loss...");
		info!(
			"initial: train_loss={:?} val_loss={:?}",
			self.mean_loss(&training),
			self.mean_loss(&validation)
		);
		info!("Training (press ctrl+c to terminate)...");
		let mut iteration = 0;
		loop {
			if cancel.is_cancelled() {
				return Ok(StopReason::Interrupted);
			}

			self.baum_welch(training.as_slice());
			let status = TrainStatus {
				iteration,
				train_loss: self.mean_loss(&training).unwrap_or(0.0),
				validation_loss: self.mean_loss(&validation),
			};
			status.log();
			iteration += 1;

			if !on_status(&status) {
				return Ok(StopReason::Stopped);
			}
			if self.flags.max_iters > 0 && iteration >= self.flags.max_iters {
				return Ok(StopReason::Finished);
			}
		}
	}

	/// Samples a state path, emitting one byte per state, until the stop
	/// transition is drawn or `length` bytes were emitted.
	fn generate(&mut self, length: usize, rng: &mut dyn RngCore) -> Result<Vec<u8>> {
		if !self.is_trained() {
			return Err(ModelError::InvalidState("hmm has not been trained".to_owned()));
		}

		let n = self.num_states;
		let mut output = Vec::new();
		let mut state = sample_weighted(&self.initial, rng);
		while output.len() < length {
			let row = &self.emissions[state * OBS_COUNT..(state + 1) * OBS_COUNT];
			output.push(sample_weighted(row, rng) as u8);

			let next = sample_weighted(&self.transitions[state * (n + 1)..(state + 1) * (n + 1)], rng);
			if next == n {
				break;
			}
			state = next;
		}
		Ok(output)
	}

	fn serialize(&self) -> Result<Vec<u8>> {
		postcard::to_stdvec(self).map_err(|e| ModelError::Serialization(e.to_string()))
	}
}

fn add_into(dst: &mut [f64], src: &[f64]) {
	for (d, s) in dst.iter_mut().zip(src) {
		*d += s;
	}
}

/// Divides `values` by their sum and returns it, or `None` if there is no mass.
fn normalize_positive(values: &mut [f64]) -> Option<f64> {
	let sum: f64 = values.iter().sum();
	if sum <= 0.0 || !sum.is_finite() {
		return None;
	}
	for v in values.iter_mut() {
		*v /= sum;
	}
	Some(sum)
}

/// Normalises in place, falling back to uniform for rows without mass.
fn normalize(values: &mut [f64]) {
	if normalize_positive(values).is_none() && !values.is_empty() {
		let uniform = 1.0 / values.len() as f64;
		values.iter_mut().for_each(|v| *v = uniform);
	}
}

/// Replaces `row` with normalised `counts`; rows with no expected count are kept.
fn copy_normalized(row: &mut [f64], counts: &[f64]) {
	let sum: f64 = counts.iter().sum();
	if sum > 0.0 && sum.is_finite() {
		for (r, c) in row.iter_mut().zip(counts) {
			*r = c / sum;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	fn assert_close(actual: f64, expected: f64, tolerance: f64) {
		assert!((actual - expected).abs() < tolerance, "{actual} != {expected}");
	}

	fn one_symbol_model(symbol: u8, stay: f64) -> HiddenMarkovModel {
		let mut emissions = vec![0.0; OBS_COUNT];
		emissions[symbol as usize] = 1.0;
		HiddenMarkovModel::from_parameters(vec![1.0], vec![stay, 1.0 - stay], emissions).unwrap()
	}

	#[test]
	fn single_state_repeats_its_symbol_until_stop() {
		let mut model = one_symbol_model(b'x', 0.7);
		let mut rng = StdRng::seed_from_u64(11);
		let mut lengths = Vec::new();
		for _ in 0..50 {
			let out = model.generate(10_000, &mut rng).unwrap();
			assert!(!out.is_empty());
			assert!(out.iter().all(|&b| b == b'x'));
			lengths.push(out.len());
		}
		assert!(lengths.iter().any(|&l| l > 1));
	}

	#[test]
	fn likelihood_of_single_state_model_is_exact() {
		let model = one_symbol_model(b'x', 0.7);
		// x x x then stop: 0.7 * 0.7 * 0.3
		assert_close(model.log_likelihood(b"xxx"), (0.7f64 * 0.7 * 0.3).ln(), 1e-12);
		// impossible symbol is softened, not infinite
		let softened = model.log_likelihood(b"y");
		assert!(softened.is_finite());
		assert_close(softened, ENTROPY_SOFTENER.ln() + 0.3f64.ln(), 1e-12);
	}

	#[test]
	fn forward_matches_softened_likelihood_on_possible_sequences() {
		let model = HiddenMarkovModel::random(4, &mut StdRng::seed_from_u64(3)).unwrap();
		let seq = b"hello world";
		let fwd = model.forward(seq).unwrap();
		let ll: f64 = fwd.scales.iter().map(|s| s.ln()).sum::<f64>() + fwd.end.ln();
		assert_close(ll, model.log_likelihood(seq), 1e-9);
	}

	#[test]
	fn baum_welch_never_decreases_training_likelihood() {
		let mut model = HiddenMarkovModel::random(3, &mut StdRng::seed_from_u64(8)).unwrap();
		let samples = SampleSet::from_bytes(["abcabcabc", "abab", "cccab", "bca"]);
		let total = |m: &HiddenMarkovModel| samples.iter().map(|s| m.log_likelihood(s)).sum::<f64>();

		let mut previous = total(&model);
		for _ in 0..6 {
			assert_eq!(model.baum_welch(samples.as_slice()), samples.len());
			let current = total(&model);
			assert!(current >= previous - 1e-9, "{current} < {previous}");
			previous = current;
		}
	}

	#[test]
	fn rows_stay_normalised_after_training() {
		let mut model = HiddenMarkovModel::random(2, &mut StdRng::seed_from_u64(5)).unwrap();
		model.baum_welch(SampleSet::from_bytes(["aaab", "ba"]).as_slice());
		for i in 0..model.num_states() {
			let trans: f64 = (0..2).map(|j| model.transition(i, j)).sum::<f64>() + model.stop(i);
			let emit: f64 = (0..OBS_COUNT).map(|o| model.emission(i, o as u8)).sum();
			assert_close(trans, 1.0, 1e-9);
			assert_close(emit, 1.0, 1e-9);
		}
	}

	#[test]
	fn mean_loss_counts_the_stop_symbol() {
		let model = one_symbol_model(b'x', 0.5);
		let samples = SampleSet::from_bytes(["x", "xx"]);
		// "x": stop 0.5, "xx": stay 0.5 then stop 0.5, over 2 + 3 symbols
		let expected = -(0.5f64.ln() + 0.25f64.ln()) / 5.0;
		assert_close(model.mean_loss(&samples).unwrap(), expected, 1e-12);
	}

	#[test]
	fn untrained_model_cannot_generate() {
		let mut model = HiddenMarkovModel::default();
		assert!(!model.is_trained());
		let err = model.generate(10, &mut StdRng::seed_from_u64(0)).unwrap_err();
		assert!(matches!(err, ModelError::InvalidState(_)));
	}

	#[test]
	fn training_from_scratch_replays_with_the_same_seed() {
		let samples = SampleSet::from_bytes(["abba", "baab", "abab"]);
		let train = |seed| {
			let mut model = HiddenMarkovModel::default();
			let flags: Vec<String> =
				["--states", "3", "--max-iters", "2", "--validation", "0"].iter().map(|s| s.to_string()).collect();
			model.configure_training(&flags).unwrap();
			model
				.train(&samples, &CancellationToken::new(), &mut StdRng::seed_from_u64(seed), &mut |_| true)
				.unwrap();
			SequenceModel::serialize(&model).unwrap()
		};
		assert_eq!(train(4), train(4));
		assert_ne!(train(4), train(5));
	}

	#[test]
	fn rejects_inconsistent_parameters() {
		let err = HiddenMarkovModel::from_parameters(vec![1.0], vec![1.0], vec![1.0]).unwrap_err();
		assert!(matches!(err, ModelError::InvalidOption(_)));
		assert!(matches!(HiddenMarkovModel::deserialize(&[1, 2, 3]), Err(ModelError::Deserialization(_))));
	}
}
