use std::cell::RefCell;

use candle_core::backprop::GradStore;
use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::rnn::{GRUState, LSTMState};
use candle_nn::{GRU, GRUConfig, LSTM, LSTMConfig, Linear, RNN, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::codec::{Alphabet, OneHotCodec};
use crate::decoder::Stepper;
use crate::error::{ModelError, Result};
use crate::samples::Sample;

/// Recurrent cell used by every layer of a network.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellKind {
	Lstm,
	Gru,
}

/// Architecture of a [`RecurrentNet`], stored in checkpoints next to the weights.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NetConfig {
	pub kind: CellKind,
	pub alphabet: Alphabet,
	pub hidden: usize,
	pub layers: usize,
	/// Probability of keeping an activation in the dropout blocks.
	pub keep: f64,
}

impl NetConfig {
	fn validate(&self) -> std::result::Result<(), String> {
		if self.hidden == 0 || self.layers == 0 {
			return Err(format!("hidden ({}) and layers ({}) must be >= 1", self.hidden, self.layers));
		}
		if !(self.keep > 0.0 && self.keep <= 1.0) {
			return Err(format!("dropout keep probability must be in (0, 1], got {}", self.keep));
		}
		Ok(())
	}
}

/// A component whose numeric behaviour depends on training mode.
///
/// Composite blocks forward the flag to every child, so switching the
/// network switches every dropout block inside it.
pub trait Block {
	fn set_training(&mut self, training: bool);
}

/// Gradient strategy of a training step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backprop {
	/// Backpropagate through the whole sequence.
	Full,
	/// Truncated BPTT: gradients flow through `tail` steps at a time, the
	/// recurrent state being rebuilt from up to `head` earlier steps.
	Truncated { head: usize, tail: usize },
}

impl Backprop {
	/// `tail == 0` disables truncation.
	pub fn new(head: usize, tail: usize) -> Self {
		if tail == 0 { Backprop::Full } else { Backprop::Truncated { head, tail } }
	}

	/// Windows `(context_start, start, end)` covering `0..steps`.
	///
	/// Steps `context_start..start` only rebuild the recurrent state;
	/// steps `start..end` produce outputs and gradients.
	pub fn windows(&self, steps: usize) -> Vec<(usize, usize, usize)> {
		match *self {
			Backprop::Truncated { head, tail } if steps > tail => (0..steps)
				.step_by(tail)
				.map(|start| (start.saturating_sub(head), start, (start + tail).min(steps)))
				.collect(),
			_ => vec![(0, 0, steps)],
		}
	}
}

enum Cell {
	Lstm(LSTM),
	Gru(GRU),
}

/// Recurrent state of one layer.
#[derive(Clone)]
pub enum CellState {
	Lstm(LSTMState),
	Gru(GRUState),
}

impl CellState {
	fn h(&self) -> &Tensor {
		match self {
			CellState::Lstm(s) => &s.h,
			CellState::Gru(s) => &s.h,
		}
	}

	/// Same values, cut from the autodiff graph.
	fn detach(&self) -> Self {
		match self {
			CellState::Lstm(s) => CellState::Lstm(LSTMState { h: s.h.detach(), c: s.c.detach() }),
			CellState::Gru(s) => CellState::Gru(GRUState { h: s.h.detach() }),
		}
	}
}

impl Cell {
	fn new(kind: CellKind, input: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
		Ok(match kind {
			CellKind::Lstm => Cell::Lstm(candle_nn::lstm(input, hidden, LSTMConfig::default(), vb)?),
			CellKind::Gru => Cell::Gru(candle_nn::gru(input, hidden, GRUConfig::default(), vb)?),
		})
	}

	fn zero_state(&self, batch: usize) -> Result<CellState> {
		Ok(match self {
			Cell::Lstm(cell) => CellState::Lstm(cell.zero_state(batch)?),
			Cell::Gru(cell) => CellState::Gru(cell.zero_state(batch)?),
		})
	}

	fn step(&self, input: &Tensor, state: &CellState) -> Result<CellState> {
		Ok(match (self, state) {
			(Cell::Lstm(cell), CellState::Lstm(s)) => CellState::Lstm(cell.step(input, s)?),
			(Cell::Gru(cell), CellState::Gru(s)) => CellState::Gru(cell.step(input, s)?),
			_ => return Err(ModelError::InvalidState("cell and state kinds differ".to_owned())),
		})
	}

	/// Runs the cell over `(batch, steps, features)`; returns the stacked
	/// outputs `(batch, steps, hidden)` and the final state.
	fn sequence(&self, input: &Tensor, state: &CellState) -> Result<(Tensor, CellState)> {
		let steps = input.dim(1)?;
		let mut state = state.clone();
		let mut outputs = Vec::with_capacity(steps);
		for t in 0..steps {
			let x = input.narrow(1, t, 1)?.squeeze(1)?.contiguous()?;
			state = self.step(&x, &state)?;
			outputs.push(state.h().clone());
		}
		Ok((Tensor::stack(&outputs, 1)?, state))
	}
}

/// Inverted dropout with its own mask generator, so training runs can be
/// replayed from a seed.
struct DropoutBlock {
	drop_p: f32,
	training: bool,
	rng: RefCell<StdRng>,
}

impl DropoutBlock {
	fn new(keep: f64) -> Self {
		Self { drop_p: (1.0 - keep) as f32, training: false, rng: RefCell::new(StdRng::from_os_rng()) }
	}

	fn reseed(&mut self, seed: u64) {
		self.rng = RefCell::new(StdRng::seed_from_u64(seed));
	}

	/// Kept activations are scaled by `1 / keep`; identity outside training.
	fn forward(&self, x: &Tensor) -> Result<Tensor> {
		if !self.training || self.drop_p <= 0.0 {
			return Ok(x.clone());
		}
		let scale = 1.0 / (1.0 - self.drop_p);
		let mut rng = self.rng.borrow_mut();
		let mask: Vec<f32> = (0..x.elem_count())
			.map(|_| if rng.random::<f32>() >= self.drop_p { scale } else { 0.0 })
			.collect();
		let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
		Ok(x.mul(&mask)?)
	}
}

impl Block for DropoutBlock {
	fn set_training(&mut self, training: bool) {
		self.training = training;
	}
}

/// One recurrent cell followed by its dropout block.
struct RecurrentLayer {
	cell: Cell,
	dropout: DropoutBlock,
}

impl Block for RecurrentLayer {
	fn set_training(&mut self, training: bool) {
		self.dropout.set_training(training);
	}
}

/// Stacked recurrent layers, a dense output layer and a log-softmax.
///
/// Maps one-hot inputs over the alphabet to log-probabilities of the
/// next symbol. Parameters live in a `VarMap` so they can be optimised
/// and checkpointed by name.
pub struct RecurrentNet {
	config: NetConfig,
	codec: OneHotCodec,
	var_map: VarMap,
	layers: Vec<RecurrentLayer>,
	output: Linear,
	device: Device,
}

/// Checkpoint payload: the architecture and a safetensors buffer of the
/// parameters, keyed by their `VarMap` names.
#[derive(Serialize, Deserialize)]
struct NetPayload {
	config: NetConfig,
	weights: Vec<u8>,
}

impl RecurrentNet {
	/// Builds a randomly initialised network.
	///
	/// # Errors
	/// `InvalidOption` if the architecture is degenerate.
	pub fn new(config: NetConfig) -> Result<Self> {
		config.validate().map_err(ModelError::InvalidOption)?;

		let device = Device::Cpu;
		let var_map = VarMap::new();
		let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
		let codec = OneHotCodec::new(config.alphabet);

		let mut layers = Vec::with_capacity(config.layers);
		let mut input = codec.size();
		for i in 0..config.layers {
			let cell = Cell::new(config.kind, input, config.hidden, vb.pp(format!("layer{i}")))?;
			layers.push(RecurrentLayer { cell, dropout: DropoutBlock::new(config.keep) });
			input = config.hidden;
		}
		let output = candle_nn::linear(config.hidden, codec.size(), vb.pp("output"))?;

		Ok(Self { config, codec, var_map, layers, output, device })
	}

	pub fn config(&self) -> &NetConfig {
		&self.config
	}

	pub fn codec(&self) -> &OneHotCodec {
		&self.codec
	}

	pub fn var_map(&self) -> &VarMap {
		&self.var_map
	}

	/// Reseeds the dropout masks of every layer from `seed`.
	pub fn reseed_dropout(&mut self, seed: u64) {
		for (i, layer) in self.layers.iter_mut().enumerate() {
			layer.dropout.reseed(seed.wrapping_add(i as u64));
		}
	}

	/// Architecture plus every parameter tensor, as safetensors bytes.
	pub fn to_bytes(&self) -> Result<Vec<u8>> {
		let weights = {
			let data = self
				.var_map
				.data()
				.lock()
				.map_err(|_| ModelError::InvalidState("parameter map lock poisoned".to_owned()))?;
			safetensors::serialize(data.iter().map(|(name, var)| (name.as_str(), var.as_tensor())), None)
				.map_err(|e| ModelError::Serialization(e.to_string()))?
		};

		let payload = NetPayload { config: self.config.clone(), weights };
		postcard::to_stdvec(&payload).map_err(|e| ModelError::Serialization(e.to_string()))
	}

	/// Rebuilds a network saved by [`RecurrentNet::to_bytes`].
	///
	/// # Errors
	/// `Deserialization` if the payload is malformed or its tensors do not
	/// match the architecture it declares.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		let malformed = |msg: String| ModelError::Deserialization(format!("rnn: {msg}"));

		let payload: NetPayload = postcard::from_bytes(bytes).map_err(|e| malformed(e.to_string()))?;
		payload.config.validate().map_err(malformed)?;
		let mut net = Self::new(payload.config)?;

		let tensors = candle_core::safetensors::load_buffer(&payload.weights, &net.device)
			.map_err(|e| malformed(e.to_string()))?;
		// Names are unique and `set_one` rejects unknown ones, so equal
		// counts mean every parameter is restored.
		let expected = net.var_map.all_vars().len();
		if tensors.len() != expected {
			return Err(malformed(format!("expected {} tensors, found {}", expected, tensors.len())));
		}
		for (name, tensor) in tensors {
			let tensor = tensor.to_dtype(DType::F32).map_err(|e| malformed(e.to_string()))?;
			net.var_map.set_one(&name, &tensor).map_err(|e| malformed(format!("{name}: {e}")))?;
		}
		Ok(net)
	}

	/// One-hot inputs and targets of a batch, padded to the longest sample.
	fn encode_batch(&self, batch: &[Sample]) -> Result<(Tensor, Tensor, usize)> {
		let steps = batch.iter().map(|s| s.len()).max().unwrap_or(0);
		let inputs: Vec<Vec<u8>> = batch.iter().map(|s| OneHotCodec::shifted_inputs(s)).collect();
		let input_rows: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
		let target_rows: Vec<&[u8]> = batch.iter().map(|s| s.bytes()).collect();

		let inputs = self.codec.encode_padded(&input_rows, steps, &self.device)?;
		let targets = self.codec.encode_padded(&target_rows, steps, &self.device)?;
		Ok((inputs, targets, steps))
	}

	fn zero_states(&self, batch: usize) -> Result<Vec<CellState>> {
		self.layers.iter().map(|l| l.cell.zero_state(batch)).collect()
	}

	/// Runs the stack over `inputs`, updating `states` in place, and
	/// returns the outputs of the last layer.
	fn run_layers(&self, inputs: &Tensor, states: &mut [CellState]) -> Result<Tensor> {
		let mut x = inputs.clone();
		for (layer, state) in self.layers.iter().zip(states.iter_mut()) {
			let (out, last) = layer.cell.sequence(&x, state)?;
			*state = last;
			x = layer.dropout.forward(&out)?;
		}
		Ok(x)
	}

	/// Summed log-likelihood of the targets in `start..end`, the
	/// recurrent state having been rebuilt over `context_start..start`.
	fn window_log_likelihood(&self, inputs: &Tensor, targets: &Tensor, window: (usize, usize, usize)) -> Result<Tensor> {
		let (context_start, start, end) = window;
		let mut states = self.zero_states(inputs.dim(0)?)?;

		if context_start < start {
			self.run_layers(&inputs.narrow(1, context_start, start - context_start)?, &mut states)?;
			states = states.iter().map(CellState::detach).collect();
		}

		let hidden = self.run_layers(&inputs.narrow(1, start, end - start)?, &mut states)?;
		let log_probs = candle_nn::ops::log_softmax(&self.output.forward(&hidden)?, D::Minus1)?;
		// Padding targets are all-zero rows and drop out of the dot product.
		Ok(log_probs.mul(&targets.narrow(1, start, end - start)?)?.sum_all()?)
	}

	/// Mean cost per real symbol of `batch` and its gradients.
	///
	/// With truncation, each window's gradients are computed separately
	/// and summed; the reported cost is the sum of the window costs.
	pub fn gradients(&self, batch: &[Sample], backprop: Backprop) -> Result<(f64, GradStore)> {
		let (inputs, targets, steps) = self.encode_batch(batch)?;
		let symbols = batch.iter().map(|s| s.len()).sum::<usize>().max(1) as f64;

		let mut cost = 0.0;
		let mut accumulated: Option<GradStore> = None;
		for window in backprop.windows(steps) {
			let loss = self.window_log_likelihood(&inputs, &targets, window)?.affine(-1.0 / symbols, 0.0)?;
			cost += loss.to_scalar::<f32>()? as f64;
			let grads = loss.backward()?;

			match accumulated.as_mut() {
				None => accumulated = Some(grads),
				Some(acc) => {
					for var in self.var_map.all_vars() {
						let Some(g) = grads.get(var.as_tensor()) else { continue };
						let sum = match acc.get(var.as_tensor()) {
							Some(prev) => prev.add(g)?,
							None => g.clone(),
						};
						acc.insert(var.as_tensor(), sum);
					}
				}
			}
		}

		let grads = accumulated.ok_or_else(|| ModelError::InvalidState("empty batch".to_owned()))?;
		Ok((cost, grads))
	}

	/// Mean cost per real symbol of `batch`, without gradients.
	pub fn cost(&self, batch: &[Sample]) -> Result<f64> {
		let (inputs, targets, steps) = self.encode_batch(batch)?;
		let symbols = batch.iter().map(|s| s.len()).sum::<usize>().max(1) as f64;
		if steps == 0 {
			return Ok(0.0);
		}
		let total = self.window_log_likelihood(&inputs, &targets, (0, 0, steps))?;
		Ok(-(total.to_scalar::<f32>()? as f64) / symbols)
	}
}

impl Block for RecurrentNet {
	fn set_training(&mut self, training: bool) {
		for layer in &mut self.layers {
			layer.set_training(training);
		}
	}
}

impl Stepper for RecurrentNet {
	type State = Vec<CellState>;

	fn start(&self) -> Result<Vec<CellState>> {
		self.zero_states(1)
	}

	fn step(&self, state: &Vec<CellState>, input: u8) -> Result<(Vec<f32>, Vec<CellState>)> {
		let mut x = self.codec.encode_tensor(input, &self.device)?;
		let mut next = Vec::with_capacity(state.len());
		for (layer, s) in self.layers.iter().zip(state) {
			let s = layer.cell.step(&x, s)?;
			x = layer.dropout.forward(s.h())?;
			next.push(s);
		}
		let log_probs = candle_nn::ops::log_softmax(&self.output.forward(&x)?, D::Minus1)?;
		Ok((log_probs.squeeze(0)?.to_vec1::<f32>()?, next))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::samples::SampleSet;

	fn small_net(kind: CellKind) -> RecurrentNet {
		RecurrentNet::new(NetConfig { kind, alphabet: Alphabet::Ascii, hidden: 6, layers: 2, keep: 1.0 }).unwrap()
	}

	fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
		a.sub(b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
	}

	#[test]
	fn windows_cover_the_sequence() {
		assert_eq!(Backprop::Full.windows(7), vec![(0, 0, 7)]);
		assert_eq!(Backprop::new(3, 0), Backprop::Full);

		let truncated = Backprop::Truncated { head: 3, tail: 4 };
		assert_eq!(truncated.windows(4), vec![(0, 0, 4)]);
		assert_eq!(truncated.windows(10), vec![(0, 0, 4), (1, 4, 8), (5, 8, 10)]);
	}

	#[test]
	fn truncated_matches_full_on_short_sequences() {
		for kind in [CellKind::Lstm, CellKind::Gru] {
			let net = small_net(kind);
			let batch = SampleSet::from_bytes(["hello", "abc", "zz"]);

			let (full_cost, full) = net.gradients(batch.as_slice(), Backprop::Full).unwrap();
			let (tbptt_cost, truncated) = net.gradients(batch.as_slice(), Backprop::new(50, 20)).unwrap();

			assert!((full_cost - tbptt_cost).abs() < 1e-6);
			for var in net.var_map().all_vars() {
				let a = full.get(var.as_tensor()).unwrap();
				let b = truncated.get(var.as_tensor()).unwrap();
				assert!(max_abs_diff(a, b) < 1e-6);
			}
		}
	}

	#[test]
	fn head_covering_the_prefix_reproduces_the_full_cost() {
		let net = small_net(CellKind::Lstm);
		let batch = SampleSet::from_bytes(["the quick brown fox"]);

		let (full_cost, _) = net.gradients(batch.as_slice(), Backprop::Full).unwrap();
		let (windowed_cost, grads) = net.gradients(batch.as_slice(), Backprop::Truncated { head: 64, tail: 4 }).unwrap();

		assert!((full_cost - windowed_cost).abs() < 1e-4, "{full_cost} vs {windowed_cost}");
		assert!((net.cost(batch.as_slice()).unwrap() - full_cost).abs() < 1e-4);
		assert!(net.var_map().all_vars().iter().all(|v| grads.get(v.as_tensor()).is_some()));
	}

	#[test]
	fn cost_of_an_untrained_net_is_near_uniform() {
		let net = small_net(CellKind::Gru);
		let cost = net.cost(SampleSet::from_bytes(["abcdef"]).as_slice()).unwrap();
		// ln(128) for a uniform prediction over ASCII
		assert!((cost - 128f64.ln()).abs() < 1.0, "{cost}");
	}

	#[test]
	fn bytes_round_trip_preserves_outputs() {
		let net = small_net(CellKind::Lstm);
		let restored = RecurrentNet::from_bytes(&net.to_bytes().unwrap()).unwrap();
		assert_eq!(restored.config(), net.config());

		let (a, _) = net.step(&net.start().unwrap(), b'q').unwrap();
		let (b, _) = restored.step(&restored.start().unwrap(), b'q').unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn rejects_degenerate_architectures_and_payloads() {
		let config = NetConfig { kind: CellKind::Gru, alphabet: Alphabet::Byte, hidden: 0, layers: 1, keep: 0.5 };
		assert!(matches!(RecurrentNet::new(config), Err(ModelError::InvalidOption(_))));
		assert!(matches!(RecurrentNet::from_bytes(b"junk"), Err(ModelError::Deserialization(_))));
	}

	#[test]
	fn payload_must_name_every_parameter_once() {
		let net = small_net(CellKind::Gru);
		let mut tensors: std::collections::HashMap<String, Tensor> = net
			.var_map()
			.data()
			.lock()
			.unwrap()
			.iter()
			.map(|(name, var)| (name.clone(), var.as_tensor().clone()))
			.collect();
		let payload = |tensors: &std::collections::HashMap<String, Tensor>| {
			let weights = safetensors::serialize(tensors.iter().map(|(n, t)| (n.as_str(), t)), None).unwrap();
			postcard::to_stdvec(&NetPayload { config: net.config().clone(), weights }).unwrap()
		};
		assert!(RecurrentNet::from_bytes(&payload(&tensors)).is_ok());

		let name = tensors.keys().next().unwrap().clone();
		let tensor = tensors.remove(&name).unwrap();
		assert!(matches!(RecurrentNet::from_bytes(&payload(&tensors)), Err(ModelError::Deserialization(_))));

		tensors.insert(format!("{name}.copy"), tensor);
		assert!(matches!(RecurrentNet::from_bytes(&payload(&tensors)), Err(ModelError::Deserialization(_))));
	}

	#[test]
	fn dropout_masks_replay_from_a_seed() {
		let mut block = DropoutBlock::new(0.5);
		let x = Tensor::ones((4, 16), DType::F32, &Device::Cpu).unwrap();
		assert_eq!(block.forward(&x).unwrap().to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());

		block.set_training(true);
		block.reseed(9);
		let first = block.forward(&x).unwrap().to_vec2::<f32>().unwrap();
		block.reseed(9);
		assert_eq!(block.forward(&x).unwrap().to_vec2::<f32>().unwrap(), first);
		assert!(first.iter().flatten().all(|&v| v == 0.0 || v == 2.0));
		assert!(first.iter().flatten().any(|&v| v == 0.0));
	}

	#[test]
	fn ascii_net_rejects_high_bytes() {
		let net = small_net(CellKind::Lstm);
		let batch = SampleSet::from_bytes([vec![200u8, 1]]);
		assert!(matches!(
			net.cost(batch.as_slice()),
			Err(ModelError::InvalidSymbol { symbol: 200, .. })
		));
	}
}
