//! Minibatch training loop shared by the gradient-trained variants.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use rand::Rng;

use crate::error::Result;
use crate::samples::{Sample, SampleSet};

/// Cooperative stop flag shared between the training loop and whoever
/// wants it to stop (a signal handler, a test, a status callback).
///
/// The loop only polls it between batches.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
	cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}
}

/// Progress report emitted after every batch or fitting iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainStatus {
	pub iteration: usize,
	/// Mean negative log-likelihood per symbol on the training data seen.
	pub train_loss: f64,
	/// Same metric on the validation sample, when there is one.
	pub validation_loss: Option<f64>,
}

impl TrainStatus {
	/// True when a reported loss is NaN or infinite.
	pub fn diverged(&self) -> bool {
		!self.train_loss.is_finite() || self.validation_loss.is_some_and(|v| !v.is_finite())
	}

	/// Logs the status line, warning on divergence.
	pub fn log(&self) {
		match self.validation_loss {
			Some(v) => info!("iter {}: cost={} validation={}", self.iteration, self.train_loss, v),
			None => info!("iter {}: cost={}", self.iteration, self.train_loss),
		}
		if self.diverged() {
			warn!("iter {}: loss diverged, consider a smaller step size", self.iteration);
		}
	}
}

/// Why a training run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
	/// The cancellation token was set.
	Interrupted,
	/// The status callback asked to stop.
	Stopped,
	/// The fitting procedure ran to completion.
	Finished,
	/// There was nothing to train on.
	NoSamples,
}

/// A model trained by gradient steps on minibatches.
pub trait GradientLearner {
	/// Switches stochastic regularisation on or off.
	fn set_training(&mut self, training: bool);

	/// Computes gradients on `batch`, applies one optimizer step scaled by
	/// `step_size` and returns the batch cost (mean NLL per symbol).
	fn train_batch(&mut self, batch: &[Sample], step_size: f64) -> Result<f64>;

	/// Cost of `batch` without touching the parameters.
	fn batch_cost(&mut self, batch: &[Sample]) -> Result<f64>;
}

/// Batch layout and step size of a [`TrainingLoop`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopConfig {
	pub step_size: f64,
	pub batch_size: usize,
	/// Samples sorted together by length before cutting batches (0 disables sorting).
	pub sort_batch: usize,
	/// Maximum number of batches, 0 for no limit.
	pub max_iters: usize,
}

impl Default for LoopConfig {
	fn default() -> Self {
		Self { step_size: 0.001, batch_size: 32, sort_batch: 128, max_iters: 0 }
	}
}

/// Drives minibatch SGD over a [`GradientLearner`].
///
/// Runs epoch after epoch until the token is cancelled, the callback
/// returns `false` or `max_iters` batches were applied. The learner is
/// in training mode during gradient steps and in evaluation mode while
/// the validation cost is measured.
pub struct TrainingLoop<'a> {
	config: LoopConfig,
	cancel: &'a CancellationToken,
}

impl<'a> TrainingLoop<'a> {
	pub fn new(config: LoopConfig, cancel: &'a CancellationToken) -> Self {
		Self { config, cancel }
	}

	pub fn run<L, R>(
		&self,
		learner: &mut L,
		training: &SampleSet,
		validation: &SampleSet,
		rng: &mut R,
		on_status: &mut dyn FnMut(&TrainStatus) -> bool,
	) -> Result<StopReason>
	where
		L: GradientLearner + ?Sized,
		R: Rng + ?Sized,
	{
		if training.is_empty() {
			warn!("No training samples, nothing to do");
			return Ok(StopReason::NoSamples);
		}

		let mut iteration = 0;
		learner.set_training(true);
		let result = self.run_epochs(learner, training, validation, rng, on_status, &mut iteration);
		learner.set_training(false);

		if let Ok(reason) = &result {
			info!("Training stopped after {} batches ({:?})", iteration, reason);
		}
		result
	}

	fn run_epochs<L, R>(
		&self,
		learner: &mut L,
		training: &SampleSet,
		validation: &SampleSet,
		rng: &mut R,
		on_status: &mut dyn FnMut(&TrainStatus) -> bool,
		iteration: &mut usize,
	) -> Result<StopReason>
	where
		L: GradientLearner + ?Sized,
		R: Rng + ?Sized,
	{
		let batch_size = self.config.batch_size.max(1);
		let mut order = training.clone();
		let mut validation = validation.clone();

		loop {
			for batch in self.epoch_batches(&mut order, batch_size, rng) {
				if self.cancel.is_cancelled() {
					return Ok(StopReason::Interrupted);
				}

				let cost = learner.train_batch(batch.as_slice(), self.config.step_size)?;
				let status = self.status(learner, *iteration, cost, &mut validation, batch_size, rng)?;
				status.log();
				*iteration += 1;

				if !on_status(&status) {
					return Ok(StopReason::Stopped);
				}
				if self.config.max_iters > 0 && *iteration >= self.config.max_iters {
					return Ok(StopReason::Finished);
				}
			}
		}
	}

	/// Shuffles `order`, sorts each `sort_batch` window by length and
	/// cuts the result into minibatches.
	fn epoch_batches<R: Rng + ?Sized>(
		&self,
		order: &mut SampleSet,
		batch_size: usize,
		rng: &mut R,
	) -> Vec<SampleSet> {
		order.shuffle(rng);

		if self.config.sort_batch > 1 {
			let mut start = 0;
			while start < order.len() {
				let end = (start + self.config.sort_batch).min(order.len());
				order.sort_range_by_len(start..end);
				start = end;
			}
		}

		(0..order.len())
			.step_by(batch_size)
			.map(|start| order.slice(start..(start + batch_size).min(order.len())))
			.collect()
	}

	fn status<L, R>(
		&self,
		learner: &mut L,
		iteration: usize,
		train_loss: f64,
		validation: &mut SampleSet,
		batch_size: usize,
		rng: &mut R,
	) -> Result<TrainStatus>
	where
		L: GradientLearner + ?Sized,
		R: Rng + ?Sized,
	{
		if validation.is_empty() {
			return Ok(TrainStatus { iteration, train_loss, validation_loss: None });
		}

		validation.shuffle(rng);
		let size = batch_size.min(validation.len());
		let batch = validation.slice(0..size);

		learner.set_training(false);
		let cost = learner.batch_cost(batch.as_slice());
		learner.set_training(true);

		Ok(TrainStatus { iteration, train_loss, validation_loss: Some(cost?) })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ModelError;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	/// Records every call so tests can check ordering and mode switches.
	#[derive(Default)]
	struct RecordingLearner {
		training: bool,
		trained_batches: Vec<Vec<usize>>,
		modes_during_train: Vec<bool>,
		modes_during_cost: Vec<bool>,
		fail_at: Option<usize>,
	}

	impl GradientLearner for RecordingLearner {
		fn set_training(&mut self, training: bool) {
			self.training = training;
		}

		fn train_batch(&mut self, batch: &[Sample], _step_size: f64) -> Result<f64> {
			if self.fail_at == Some(self.trained_batches.len()) {
				return Err(ModelError::InvalidState("boom".to_owned()));
			}
			self.modes_during_train.push(self.training);
			self.trained_batches.push(batch.iter().map(|s| s.len()).collect());
			Ok(1.0)
		}

		fn batch_cost(&mut self, _batch: &[Sample]) -> Result<f64> {
			self.modes_during_cost.push(self.training);
			Ok(2.0)
		}
	}

	fn corpus(n: usize) -> SampleSet {
		SampleSet::from_bytes((1..=n).map(|i| vec![b'x'; i]))
	}

	#[test]
	fn stops_after_max_iters_with_mode_toggling() {
		let cancel = CancellationToken::new();
		let config = LoopConfig { batch_size: 4, sort_batch: 8, max_iters: 5, ..Default::default() };
		let mut learner = RecordingLearner::default();
		let mut statuses = Vec::new();

		let reason = TrainingLoop::new(config, &cancel)
			.run(&mut learner, &corpus(10), &corpus(3), &mut StdRng::seed_from_u64(1), &mut |s| {
				statuses.push(s.clone());
				true
			})
			.unwrap();

		assert_eq!(reason, StopReason::Finished);
		assert_eq!(learner.trained_batches.len(), 5);
		assert!(learner.modes_during_train.iter().all(|&t| t));
		assert!(learner.modes_during_cost.iter().all(|&t| !t));
		assert!(!learner.training);
		assert_eq!(statuses.len(), 5);
		assert_eq!(statuses[4].validation_loss, Some(2.0));
	}

	#[test]
	fn batches_within_a_sort_window_are_length_sorted() {
		let cancel = CancellationToken::new();
		let config = LoopConfig { batch_size: 5, sort_batch: 10, max_iters: 2, ..Default::default() };
		let mut learner = RecordingLearner::default();

		TrainingLoop::new(config, &cancel)
			.run(&mut learner, &corpus(10), &SampleSet::default(), &mut StdRng::seed_from_u64(9), &mut |_| true)
			.unwrap();

		let flat: Vec<usize> = learner.trained_batches.concat();
		assert_eq!(flat, (1..=10).collect::<Vec<_>>());
	}

	#[test]
	fn cancellation_completes_the_current_batch() {
		let cancel = CancellationToken::new();
		let mut learner = RecordingLearner::default();
		let token = cancel.clone();

		let reason = TrainingLoop::new(LoopConfig { batch_size: 2, ..Default::default() }, &cancel)
			.run(&mut learner, &corpus(10), &SampleSet::default(), &mut StdRng::seed_from_u64(2), &mut |s| {
				if s.iteration == 2 {
					token.cancel();
				}
				true
			})
			.unwrap();

		assert_eq!(reason, StopReason::Interrupted);
		assert_eq!(learner.trained_batches.len(), 3);
	}

	#[test]
	fn callback_can_stop_and_errors_propagate() {
		let cancel = CancellationToken::new();
		let mut learner = RecordingLearner::default();
		let reason = TrainingLoop::new(LoopConfig::default(), &cancel)
			.run(&mut learner, &corpus(4), &SampleSet::default(), &mut StdRng::seed_from_u64(2), &mut |_| false)
			.unwrap();
		assert_eq!(reason, StopReason::Stopped);

		let mut failing = RecordingLearner { fail_at: Some(1), ..Default::default() };
		let err = TrainingLoop::new(LoopConfig { batch_size: 1, ..Default::default() }, &cancel)
			.run(&mut failing, &corpus(4), &SampleSet::default(), &mut StdRng::seed_from_u64(2), &mut |_| true)
			.unwrap_err();
		assert!(matches!(err, ModelError::InvalidState(_)));
		assert!(!failing.training);
	}

	#[test]
	fn empty_training_set_does_nothing() {
		let cancel = CancellationToken::new();
		let mut learner = RecordingLearner::default();
		let reason = TrainingLoop::new(LoopConfig::default(), &cancel)
			.run(&mut learner, &SampleSet::default(), &corpus(2), &mut StdRng::seed_from_u64(2), &mut |_| true)
			.unwrap();
		assert_eq!(reason, StopReason::NoSamples);
		assert!(learner.trained_batches.is_empty());
	}

	#[test]
	fn divergence_is_detected() {
		let status = TrainStatus { iteration: 0, train_loss: f64::NAN, validation_loss: None };
		assert!(status.diverged());
		let status = TrainStatus { iteration: 0, train_loss: 1.0, validation_loss: Some(f64::INFINITY) };
		assert!(status.diverged());
	}
}
