use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Symbol fed to a model before the first real byte of a sequence.
pub const START_SYMBOL: u8 = 0;

/// Number of symbols a codec can represent.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Alphabet {
	/// 7-bit ASCII, 128 symbols.
	Ascii,
	/// Every byte value, 256 symbols.
	#[default]
	Byte,
}

impl Alphabet {
	pub fn size(self) -> usize {
		match self {
			Alphabet::Ascii => 128,
			Alphabet::Byte => 256,
		}
	}
}

/// Converts bytes to one-hot vectors over an alphabet and back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OneHotCodec {
	alphabet: Alphabet,
}

impl OneHotCodec {
	pub fn new(alphabet: Alphabet) -> Self {
		Self { alphabet }
	}

	pub fn alphabet(&self) -> Alphabet {
		self.alphabet
	}

	pub fn size(&self) -> usize {
		self.alphabet.size()
	}

	/// Fails with `InvalidSymbol` if `byte` is outside the alphabet.
	pub fn check(&self, byte: u8) -> Result<()> {
		if (byte as usize) < self.size() {
			Ok(())
		} else {
			Err(ModelError::InvalidSymbol { symbol: byte, alphabet: self.size() })
		}
	}

	/// Vector of `size()` zeros with a single one at `byte`.
	pub fn encode(&self, byte: u8) -> Result<Vec<f32>> {
		self.check(byte)?;
		let mut vector = vec![0.0; self.size()];
		vector[byte as usize] = 1.0;
		Ok(vector)
	}

	/// Greedy decoding: the index of the largest component.
	///
	/// Ties resolve to the lowest index. Returns `None` for an empty vector.
	pub fn decode(&self, vector: &[f32]) -> Option<u8> {
		let mut best: Option<(usize, f32)> = None;
		for (i, &x) in vector.iter().enumerate().take(self.size()) {
			match best {
				Some((_, b)) if b >= x => (),
				_ => best = Some((i, x)),
			}
		}
		best.map(|(i, _)| i as u8)
	}

	/// Model inputs for a chunk: the start symbol followed by every byte
	/// except the last. Each input predicts the byte at the same position.
	pub fn shifted_inputs(chunk: &[u8]) -> Vec<u8> {
		let mut inputs = Vec::with_capacity(chunk.len());
		if !chunk.is_empty() {
			inputs.push(START_SYMBOL);
			inputs.extend_from_slice(&chunk[..chunk.len() - 1]);
		}
		inputs
	}

	/// One-hot tensor of shape `(1, size)` for a single symbol.
	pub fn encode_tensor(&self, byte: u8, device: &Device) -> Result<Tensor> {
		let data = self.encode(byte)?;
		Ok(Tensor::from_vec(data, (1, self.size()), device)?)
	}

	/// One-hot tensor of shape `(rows.len(), steps, size)`.
	///
	/// Positions past the end of a row (padding) are all-zero vectors,
	/// which contribute nothing to a dot-product cost.
	pub fn encode_padded(&self, rows: &[&[u8]], steps: usize, device: &Device) -> Result<Tensor> {
		let size = self.size();
		let mut data = vec![0f32; rows.len() * steps * size];
		for (r, row) in rows.iter().enumerate() {
			for (t, &byte) in row.iter().take(steps).enumerate() {
				self.check(byte)?;
				data[(r * steps + t) * size + byte as usize] = 1.0;
			}
		}
		Ok(Tensor::from_vec(data, (rows.len(), steps, size), device)?)
	}
}

impl Default for OneHotCodec {
	fn default() -> Self {
		Self::new(Alphabet::Byte)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_decode_round_trip() {
		for alphabet in [Alphabet::Ascii, Alphabet::Byte] {
			let codec = OneHotCodec::new(alphabet);
			for b in 0..alphabet.size() {
				let v = codec.encode(b as u8).unwrap();
				assert_eq!(v.len(), alphabet.size());
				assert_eq!(v.iter().sum::<f32>(), 1.0);
				assert_eq!(codec.decode(&v), Some(b as u8));
			}
		}
	}

	#[test]
	fn ascii_rejects_high_bytes() {
		let codec = OneHotCodec::new(Alphabet::Ascii);
		assert!(matches!(
			codec.encode(200),
			Err(ModelError::InvalidSymbol { symbol: 200, alphabet: 128 })
		));
	}

	#[test]
	fn inputs_are_shifted_behind_start_symbol() {
		assert_eq!(OneHotCodec::shifted_inputs(b"abc"), vec![START_SYMBOL, b'a', b'b']);
		assert!(OneHotCodec::shifted_inputs(b"").is_empty());
	}

	#[test]
	fn padded_encoding_leaves_tail_empty() {
		let codec = OneHotCodec::new(Alphabet::Ascii);
		let rows: [&[u8]; 2] = [b"ab", b"c"];
		let t = codec.encode_padded(&rows, 2, &Device::Cpu).unwrap();
		assert_eq!(t.dims(), &[2, 2, 128]);

		let sums: Vec<Vec<f32>> = t.sum(2).unwrap().to_vec2().unwrap();
		assert_eq!(sums, vec![vec![1.0, 1.0], vec![1.0, 0.0]]);
	}
}
