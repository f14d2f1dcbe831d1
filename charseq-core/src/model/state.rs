use std::collections::BTreeMap;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Outcome of one step of a Markov chain: another byte, or the end of the sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
	Byte(u8),
	End,
}

/// A state of the Markov chain.
///
/// A `State` corresponds to a history of at most `history` bytes (`key`)
/// and stores every observed transition out of it.
///
/// ## Invariants
/// - All transitions belong to the same `key`
/// - Each stored occurrence count is strictly positive
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct State {
	/// The byte history identifying this state.
	key: Vec<u8>,
	/// Outgoing byte transitions and how many times each was observed.
	/// Example: { b'e' => 42, b'a' => 3 }
	transitions: BTreeMap<u8, u64>,
	/// How many samples ended in this state.
	terminal: u64,
}

impl State {
	/// Creates a new empty state for the given history.
	pub fn new(key: &[u8]) -> Self {
		Self { key: key.to_vec(), transitions: BTreeMap::new(), terminal: 0 }
	}

	pub fn key(&self) -> &[u8] {
		&self.key
	}

	/// Records an occurrence of `transition`.
	pub fn add_transition(&mut self, transition: Transition) {
		match transition {
			Transition::Byte(b) => *self.transitions.entry(b).or_insert(0) += 1,
			Transition::End => self.terminal += 1,
		}
	}

	/// Raw occurrence count of `transition`.
	pub fn count(&self, transition: Transition) -> u64 {
		match transition {
			Transition::Byte(b) => self.transitions.get(&b).copied().unwrap_or(0),
			Transition::End => self.terminal,
		}
	}

	/// Total number of observations leaving this state.
	pub fn total(&self) -> u64 {
		self.transitions.values().sum::<u64>() + self.terminal
	}

	/// Normalised probability of `transition`, 0 when never observed.
	pub fn probability(&self, transition: Transition) -> f64 {
		let total = self.total();
		if total == 0 {
			return 0.0;
		}
		self.count(transition) as f64 / total as f64
	}

	/// The normalised row: every observed transition with its probability.
	pub fn distribution(&self) -> Vec<(Transition, f64)> {
		let mut row: Vec<(Transition, f64)> = self
			.transitions
			.keys()
			.map(|&b| (Transition::Byte(b), self.probability(Transition::Byte(b))))
			.collect();
		if self.terminal > 0 {
			row.push((Transition::End, self.probability(Transition::End)));
		}
		row
	}

	/// Picks the next transition by weighted random sampling.
	///
	/// The probability of each transition is proportional to its
	/// occurrence count. Returns `None` if the state has no transitions.
	pub fn predict(&self, rng: &mut dyn RngCore) -> Option<Transition> {
		let total = self.total();
		if total == 0 {
			return None;
		}

		let mut r = rng.random_range(0..total);
		for (&b, &occurrence) in &self.transitions {
			if r < occurrence {
				return Some(Transition::Byte(b));
			}
			r -= occurrence;
		}
		Some(Transition::End)
	}

	/// Merges another state into this one.
	///
	/// Both states must represent the same history. Occurrence counts are
	/// summed, which lets partial chains built in parallel be combined.
	///
	/// # Errors
	/// Returns an error if the state keys do not match.
	pub fn merge(&mut self, other: &Self) -> Result<(), String> {
		if self.key != other.key {
			return Err("Key mismatch".to_owned());
		}

		for (b, occurrence) in &other.transitions {
			*self.transitions.entry(*b).or_insert(0) += *occurrence;
		}
		self.terminal += other.terminal;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	#[test]
	fn counts_and_probabilities() {
		let mut state = State::new(b"a");
		state.add_transition(Transition::Byte(b'b'));
		state.add_transition(Transition::Byte(b'b'));
		state.add_transition(Transition::End);

		assert_eq!(state.count(Transition::Byte(b'b')), 2);
		assert_eq!(state.total(), 3);
		assert_eq!(state.probability(Transition::Byte(b'z')), 0.0);

		let sum: f64 = state.distribution().iter().map(|(_, p)| p).sum();
		assert!((sum - 1.0).abs() < 1e-12);
	}

	#[test]
	fn predict_only_returns_observed_transitions() {
		let mut state = State::new(b"");
		state.add_transition(Transition::Byte(b'q'));
		let mut rng = StdRng::seed_from_u64(0);
		for _ in 0..20 {
			assert_eq!(state.predict(&mut rng), Some(Transition::Byte(b'q')));
		}
		assert_eq!(State::new(b"x").predict(&mut rng), None);
	}

	#[test]
	fn merge_sums_counts_and_checks_keys() {
		let mut a = State::new(b"k");
		a.add_transition(Transition::Byte(1));
		let mut b = State::new(b"k");
		b.add_transition(Transition::Byte(1));
		b.add_transition(Transition::End);

		a.merge(&b).unwrap();
		assert_eq!(a.count(Transition::Byte(1)), 2);
		assert_eq!(a.count(Transition::End), 1);
		assert!(a.merge(&State::new(b"other")).is_err());
	}
}
