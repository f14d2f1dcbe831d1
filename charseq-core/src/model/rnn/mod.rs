//! Stacked LSTM or GRU networks trained with minibatch AdamW and
//! truncated backpropagation through time.

use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use clap::Parser;
use log::info;
use rand::RngCore;

use super::{SequenceModel, flags_usage, log_split, parse_flags};
use crate::codec::Alphabet;
use crate::decoder::{DecodeOptions, check_temperature, decode};
use crate::error::{ModelError, Result};
use crate::samples::{Sample, SampleSet};
use crate::training::{CancellationToken, GradientLearner, LoopConfig, StopReason, TrainStatus, TrainingLoop};

mod network;

pub use network::{Backprop, Block, CellKind, CellState, NetConfig, RecurrentNet};

/// Checkpoint type tag of an LSTM [`RecurrentModel`].
pub const LSTM_TYPE: &str = "charseq.LSTM";

/// Checkpoint type tag of a GRU [`RecurrentModel`].
pub const GRU_TYPE: &str = "charseq.GRU";

/// Training options of a recurrent network.
#[derive(Parser, Clone, Debug, PartialEq)]
pub struct RnnTrainingFlags {
	/// Hidden units per layer (new networks only)
	#[arg(long, default_value_t = 512)]
	pub hidden: usize,

	/// Number of recurrent layers (new networks only)
	#[arg(long, default_value_t = 2)]
	pub layers: usize,

	/// Optimizer step size
	#[arg(long, default_value_t = 0.001)]
	pub step: f64,

	/// Validation fraction
	#[arg(long, default_value_t = 0.1)]
	pub validation: f64,

	/// Dropout keep probability (new networks only)
	#[arg(long, default_value_t = 0.6)]
	pub dropout: f64,

	/// Minibatch size
	#[arg(long, default_value_t = 32)]
	pub batch: usize,

	/// Samples sorted together by length before batching
	#[arg(long = "sortbatch", default_value_t = 128)]
	pub sort_batch: usize,

	/// TBPTT context steps run without gradients
	#[arg(long, default_value_t = 50)]
	pub head: usize,

	/// TBPTT steps per gradient window (0 = full backpropagation)
	#[arg(long, default_value_t = 20)]
	pub tail: usize,

	/// Number of batches to train (0 = until interrupted)
	#[arg(long, default_value_t = 0)]
	pub max_iters: usize,

	/// Use a 128-symbol ASCII alphabet (new networks only)
	#[arg(long)]
	pub ascii: bool,
}

impl Default for RnnTrainingFlags {
	fn default() -> Self {
		Self {
			hidden: 512,
			layers: 2,
			step: 0.001,
			validation: 0.1,
			dropout: 0.6,
			batch: 32,
			sort_batch: 128,
			head: 50,
			tail: 20,
			max_iters: 0,
			ascii: false,
		}
	}
}

impl RnnTrainingFlags {
	fn net_config(&self, kind: CellKind) -> NetConfig {
		NetConfig {
			kind,
			alphabet: if self.ascii { Alphabet::Ascii } else { Alphabet::Byte },
			hidden: self.hidden,
			layers: self.layers,
			keep: self.dropout,
		}
	}

	fn loop_config(&self) -> LoopConfig {
		LoopConfig { step_size: self.step, batch_size: self.batch, sort_batch: self.sort_batch, max_iters: self.max_iters }
	}
}

/// Generation options of a recurrent network.
#[derive(Parser, Clone, Debug, PartialEq)]
pub struct RnnGenerationFlags {
	/// Sampling temperature
	#[arg(long, default_value_t = 1.0)]
	pub temperature: f64,

	/// Text forced onto the start of the output
	#[arg(long, default_value = "")]
	pub seed: String,
}

impl Default for RnnGenerationFlags {
	fn default() -> Self {
		Self { temperature: 1.0, seed: String::new() }
	}
}

/// A recurrent network behind the [`SequenceModel`] interface.
///
/// The network is created on the first call to `train` from the training
/// flags; a network restored from a checkpoint keeps its architecture.
pub struct RecurrentModel {
	kind: CellKind,
	net: Option<RecurrentNet>,
	pub training: RnnTrainingFlags,
	pub generation: RnnGenerationFlags,
}

impl RecurrentModel {
	pub fn new(kind: CellKind) -> Self {
		Self { kind, net: None, training: Default::default(), generation: Default::default() }
	}

	pub fn lstm() -> Self {
		Self::new(CellKind::Lstm)
	}

	pub fn gru() -> Self {
		Self::new(CellKind::Gru)
	}

	pub fn from_net(net: RecurrentNet) -> Self {
		Self { kind: net.config().kind, net: Some(net), training: Default::default(), generation: Default::default() }
	}

	pub fn deserialize(bytes: &[u8]) -> Result<Self> {
		Ok(Self::from_net(RecurrentNet::from_bytes(bytes)?))
	}

	pub fn net(&self) -> Option<&RecurrentNet> {
		self.net.as_ref()
	}

	fn ensure_net(&mut self) -> Result<&mut RecurrentNet> {
		if self.net.is_some() {
			info!("Continuing existing network, architecture flags are ignored");
		} else {
			info!("Creating new network...");
			self.net = Some(RecurrentNet::new(self.training.net_config(self.kind))?);
		}
		self.net.as_mut().ok_or_else(|| ModelError::InvalidState("network missing".to_owned()))
	}
}

/// Applies AdamW steps to a network.
struct RnnLearner<'a> {
	net: &'a mut RecurrentNet,
	optimizer: AdamW,
	backprop: Backprop,
}

impl<'a> RnnLearner<'a> {
	fn new(net: &'a mut RecurrentNet, flags: &RnnTrainingFlags) -> Result<Self> {
		let params = ParamsAdamW { lr: flags.step, weight_decay: 0.0, ..Default::default() };
		let optimizer = AdamW::new(net.var_map().all_vars(), params)?;
		Ok(Self { net, optimizer, backprop: Backprop::new(flags.head, flags.tail) })
	}
}

impl GradientLearner for RnnLearner<'_> {
	fn set_training(&mut self, training: bool) {
		self.net.set_training(training);
	}

	fn train_batch(&mut self, batch: &[Sample], step_size: f64) -> Result<f64> {
		let (cost, grads) = self.net.gradients(batch, self.backprop)?;
		self.optimizer.set_learning_rate(step_size);
		self.optimizer.step(&grads)?;
		Ok(cost)
	}

	fn batch_cost(&mut self, batch: &[Sample]) -> Result<f64> {
		self.net.cost(batch)
	}
}

impl SequenceModel for RecurrentModel {
	fn name(&self) -> &'static str {
		match self.kind {
			CellKind::Lstm => "lstm",
			CellKind::Gru => "gru",
		}
	}

	fn type_tag(&self) -> &'static str {
		match self.kind {
			CellKind::Lstm => LSTM_TYPE,
			CellKind::Gru => GRU_TYPE,
		}
	}

	fn configure_training(&mut self, args: &[String]) -> Result<()> {
		self.training = parse_flags(self.name(), args)?;
		Ok(())
	}

	fn configure_generation(&mut self, args: &[String]) -> Result<()> {
		let flags: RnnGenerationFlags = parse_flags(self.name(), args)?;
		check_temperature(flags.temperature)?;
		self.generation = flags;
		Ok(())
	}

	fn training_usage(&self) -> String {
		flags_usage::<RnnTrainingFlags>(self.name())
	}

	fn generation_usage(&self) -> String {
		flags_usage::<RnnGenerationFlags>(self.name())
	}

	fn is_trained(&self) -> bool {
		self.net.is_some()
	}

	fn train(
		&mut self,
		samples: &SampleSet,
		cancel: &CancellationToken,
		rng: &mut dyn RngCore,
		on_status: &mut dyn FnMut(&TrainStatus) -> bool,
	) -> Result<StopReason> {
		let flags = self.training.clone();
		let net = self.ensure_net()?;

		let codec = *net.codec();
		for sample in samples.iter() {
			for &b in sample.bytes() {
				codec.check(b)?;
			}
		}

		let (validation, training) = samples.hash_split(flags.validation);
		log_split(&training, &validation);
		net.reseed_dropout(rng.next_u64());

		info!("Training (press ctrl+c to terminate)...");
		let mut learner = RnnLearner::new(net, &flags)?;
		TrainingLoop::new(flags.loop_config(), cancel).run(
			&mut learner,
			&training,
			&validation,
			rng,
			on_status,
		)
	}

	/// Decodes `length` bytes with the configured temperature and seed.
	fn generate(&mut self, length: usize, rng: &mut dyn RngCore) -> Result<Vec<u8>> {
		let net = self
			.net
			.as_mut()
			.ok_or_else(|| ModelError::InvalidState("network has not been trained".to_owned()))?;
		net.set_training(false);

		let options = DecodeOptions {
			length,
			temperature: self.generation.temperature,
			seed: self.generation.seed.clone().into_bytes(),
		};
		decode(&*net, &options, rng)
	}

	fn serialize(&self) -> Result<Vec<u8>> {
		self.net
			.as_ref()
			.ok_or_else(|| ModelError::InvalidState("network has not been trained".to_owned()))?
			.to_bytes()
	}
}
