//! Temperature-controlled sampling and the step-by-step generation loop.

use rand::{Rng, RngCore};

use crate::codec::START_SYMBOL;
use crate::error::{ModelError, Result};

/// A model that can be advanced one symbol at a time.
///
/// `step` consumes the previous symbol and returns the log-probabilities
/// of the next one together with the updated recurrent state.
pub trait Stepper {
	type State;

	fn start(&self) -> Result<Self::State>;

	fn step(&self, state: &Self::State, input: u8) -> Result<(Vec<f32>, Self::State)>;
}

/// Options of a single generation run.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeOptions {
	/// Number of symbols to emit.
	pub length: usize,
	/// Softmax temperature, strictly positive.
	pub temperature: f64,
	/// Prefix forced onto the first outputs. Forced steps still draw from
	/// the RNG, so the stream after the seed does not depend on its length.
	pub seed: Vec<u8>,
}

impl Default for DecodeOptions {
	fn default() -> Self {
		Self { length: 100, temperature: 1.0, seed: Vec::new() }
	}
}

/// Fails with `InvalidOption` unless `temperature` is finite and positive.
pub fn check_temperature(temperature: f64) -> Result<()> {
	if temperature.is_finite() && temperature > 0.0 {
		Ok(())
	} else {
		Err(ModelError::InvalidOption(format!(
			"temperature must be > 0, got {}",
			temperature
		)))
	}
}

/// Draws an index from a distribution given as log-probabilities.
///
/// The log-probabilities are divided by `temperature` and exponentiated;
/// the result is renormalised and walked until the cumulative mass
/// exceeds a uniform draw. Rounding may leave the draw unmet after the
/// full pass, in which case the last index is returned.
pub fn sample_log_index<R: Rng + ?Sized>(log_probs: &[f32], temperature: f64, rng: &mut R) -> usize {
	let max = log_probs
		.iter()
		.map(|&x| x as f64 / temperature)
		.fold(f64::NEG_INFINITY, f64::max);
	let weights: Vec<f64> = log_probs
		.iter()
		.map(|&x| (x as f64 / temperature - max).exp())
		.collect();
	sample_weighted(&weights, rng)
}

/// Draws an index with probability proportional to `weights`.
///
/// Falls back to the last index when rounding leaves the draw unmet.
pub fn sample_weighted<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
	let total: f64 = weights.iter().sum();
	let draw: f64 = rng.random();

	let mut cumulative = 0.0;
	for (i, w) in weights.iter().enumerate() {
		cumulative += w;
		if cumulative / total > draw {
			return i;
		}
	}
	weights.len().saturating_sub(1)
}

/// Runs `stepper` for `options.length` steps and returns the emitted bytes.
///
/// Step 0 is fed the start symbol, every later step the previously
/// emitted byte. Every step samples; the first `seed.len()` samples are
/// then replaced by the seed.
pub fn decode<S: Stepper>(stepper: &S, options: &DecodeOptions, rng: &mut dyn RngCore) -> Result<Vec<u8>> {
	check_temperature(options.temperature)?;

	let mut output = Vec::with_capacity(options.length);
	let mut state = stepper.start()?;
	let mut last = START_SYMBOL;

	for i in 0..options.length {
		let (log_probs, next_state) = stepper.step(&state, last)?;
		let sampled = sample_log_index(&log_probs, options.temperature, rng) as u8;
		let symbol = options.seed.get(i).copied().unwrap_or(sampled);

		output.push(symbol);
		last = symbol;
		state = next_state;
	}

	Ok(output)
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	/// Fixed distribution regardless of input; records the inputs it saw.
	struct FixedStepper {
		log_probs: Vec<f32>,
	}

	impl Stepper for FixedStepper {
		type State = Vec<u8>;

		fn start(&self) -> Result<Vec<u8>> {
			Ok(Vec::new())
		}

		fn step(&self, state: &Vec<u8>, input: u8) -> Result<(Vec<f32>, Vec<u8>)> {
			let mut seen = state.clone();
			seen.push(input);
			Ok((self.log_probs.clone(), seen))
		}
	}

	fn ln(probs: &[f64]) -> Vec<f32> {
		probs.iter().map(|p| p.ln() as f32).collect()
	}

	#[test]
	fn sampling_is_reproducible_with_a_seed() {
		let log_probs = ln(&[0.1, 0.2, 0.3, 0.4]);
		let draw = |seed| {
			let mut rng = StdRng::seed_from_u64(seed);
			(0..20).map(|_| sample_log_index(&log_probs, 1.0, &mut rng)).collect::<Vec<_>>()
		};
		assert_eq!(draw(42), draw(42));
	}

	#[test]
	fn unit_temperature_matches_distribution() {
		let probs = [0.1, 0.2, 0.3, 0.4];
		let log_probs = ln(&probs);
		let mut rng = StdRng::seed_from_u64(1234);
		let draws = 40_000;

		let mut counts = [0usize; 4];
		for _ in 0..draws {
			counts[sample_log_index(&log_probs, 1.0, &mut rng)] += 1;
		}

		let chi_square: f64 = counts
			.iter()
			.zip(probs.iter())
			.map(|(&observed, &p)| {
				let expected = p * draws as f64;
				(observed as f64 - expected).powi(2) / expected
			})
			.sum();
		// 3 degrees of freedom, p = 0.001
		assert!(chi_square < 16.27, "chi-square {chi_square} for {counts:?}");
	}

	#[test]
	fn low_temperature_sharpens() {
		let log_probs = ln(&[0.3, 0.7]);
		let mut rng = StdRng::seed_from_u64(5);
		let hits = (0..2000)
			.filter(|_| sample_log_index(&log_probs, 0.05, &mut rng) == 1)
			.count();
		assert!(hits > 1990);
	}

	#[test]
	fn unmet_draw_falls_back_to_last_index() {
		let log_probs = vec![f32::NEG_INFINITY; 3];
		let mut rng = StdRng::seed_from_u64(0);
		assert_eq!(sample_log_index(&log_probs, 1.0, &mut rng), 2);
	}

	#[test]
	fn seed_forces_the_first_outputs() {
		let stepper = FixedStepper { log_probs: ln(&[0.0, 0.0, 1.0]) };
		let options = DecodeOptions { length: 5, temperature: 1.0, seed: vec![0, 1] };
		let output = decode(&stepper, &options, &mut StdRng::seed_from_u64(3)).unwrap();
		assert_eq!(output, vec![0, 1, 2, 2, 2]);
	}

	#[test]
	fn forced_steps_consume_draws() {
		let uniform = FixedStepper { log_probs: ln(&[0.25; 4]) };
		let options = DecodeOptions { length: 12, temperature: 1.0, seed: vec![0; 4] };
		let output = decode(&uniform, &options, &mut StdRng::seed_from_u64(17)).unwrap();

		let mut rng = StdRng::seed_from_u64(17);
		let draws: Vec<u8> = (0..12).map(|_| sample_log_index(&uniform.log_probs, 1.0, &mut rng) as u8).collect();
		assert_eq!(&output[..4], &[0, 0, 0, 0]);
		assert_eq!(&output[4..], &draws[4..]);
	}

	#[test]
	fn high_temperature_flattens() {
		let log_probs = ln(&[0.1, 0.9]);
		let share = |temperature| {
			let mut rng = StdRng::seed_from_u64(8);
			(0..20_000).filter(|_| sample_log_index(&log_probs, temperature, &mut rng) == 0).count() as f64 / 20_000.0
		};
		// 0.1^(1/4) / (0.1^(1/4) + 0.9^(1/4)) ~ 0.365
		assert!((share(1.0) - 0.1).abs() < 0.02);
		assert!((share(4.0) - 0.365).abs() < 0.02);
	}

	#[test]
	fn rejects_non_positive_temperature() {
		let stepper = FixedStepper { log_probs: ln(&[1.0]) };
		let options = DecodeOptions { length: 1, temperature: 0.0, seed: Vec::new() };
		let err = decode(&stepper, &options, &mut StdRng::seed_from_u64(3)).unwrap_err();
		assert!(matches!(err, ModelError::InvalidOption(_)));
	}
}
