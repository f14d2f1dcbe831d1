use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::io;
use crate::model::SequenceModel;
use crate::model::hmm::{HMM_TYPE, HiddenMarkovModel};
use crate::model::markov::{MARKOV_TYPE, MarkovModel};
use crate::model::rnn::{GRU_TYPE, LSTM_TYPE, RecurrentModel};

/// On-disk envelope: the variant's type tag and its opaque payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
	pub tag: String,
	pub payload: Vec<u8>,
}

impl Checkpoint {
	pub fn to_bytes(&self) -> Result<Vec<u8>> {
		postcard::to_stdvec(self).map_err(|e| ModelError::Serialization(e.to_string()))
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		postcard::from_bytes(bytes).map_err(|e| ModelError::Deserialization(format!("checkpoint: {e}")))
	}
}

type CreateFn = fn() -> Box<dyn SequenceModel>;
type DeserializeFn = fn(&[u8]) -> Result<Box<dyn SequenceModel>>;

/// One model variant known to a [`ModelRegistry`].
#[derive(Clone, Copy)]
pub struct ModelEntry {
	/// Name on the command line.
	pub name: &'static str,
	/// Type tag written into checkpoints.
	pub tag: &'static str,
	pub create: CreateFn,
	pub deserialize: DeserializeFn,
}

/// Maps variant names to constructors and checkpoint tags to deserializers.
///
/// # Responsibilities
/// - Create a fresh model from its command-line name
/// - Tag a model's payload on save and dispatch on that tag on load
///
/// # Invariants
/// - Names and tags are unique within a registry
///
/// The registry is an ordinary value built at startup and passed where it
/// is needed, so tests can build registries of their own.
#[derive(Clone, Default)]
pub struct ModelRegistry {
	entries: Vec<ModelEntry>,
}

impl ModelRegistry {
	/// An empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Every built-in variant: `lstm`, `gru`, `markov` and `hmm`.
	pub fn with_defaults() -> Self {
		let mut registry = Self::new();
		let defaults = [
			ModelEntry {
				name: "lstm",
				tag: LSTM_TYPE,
				create: || Box::new(RecurrentModel::lstm()),
				deserialize: |b| Ok(Box::new(RecurrentModel::deserialize(b)?)),
			},
			ModelEntry {
				name: "gru",
				tag: GRU_TYPE,
				create: || Box::new(RecurrentModel::gru()),
				deserialize: |b| Ok(Box::new(RecurrentModel::deserialize(b)?)),
			},
			ModelEntry {
				name: "markov",
				tag: MARKOV_TYPE,
				create: || Box::new(MarkovModel::default()),
				deserialize: |b| Ok(Box::new(MarkovModel::deserialize(b)?)),
			},
			ModelEntry {
				name: "hmm",
				tag: HMM_TYPE,
				create: || Box::new(HiddenMarkovModel::default()),
				deserialize: |b| Ok(Box::new(HiddenMarkovModel::deserialize(b)?)),
			},
		];
		for entry in defaults {
			// Built-in names and tags are distinct.
			let _ = registry.register(entry);
		}
		registry
	}

	/// Adds a variant.
	///
	/// # Errors
	/// `InvalidState` if its name or tag is already registered.
	pub fn register(&mut self, entry: ModelEntry) -> Result<()> {
		if self.entries.iter().any(|e| e.name == entry.name || e.tag == entry.tag) {
			return Err(ModelError::InvalidState(format!(
				"model {} ({}) already registered",
				entry.name, entry.tag
			)));
		}
		self.entries.push(entry);
		Ok(())
	}

	/// Registered names, in registration order.
	pub fn names(&self) -> Vec<&'static str> {
		self.entries.iter().map(|e| e.name).collect()
	}

	/// A fresh, untrained model of the named variant.
	pub fn create(&self, name: &str) -> Result<Box<dyn SequenceModel>> {
		self.entries
			.iter()
			.find(|e| e.name == name)
			.map(|e| (e.create)())
			.ok_or_else(|| ModelError::UnknownModel(name.to_owned()))
	}

	/// Serializes `model` behind its type tag.
	pub fn save(&self, model: &dyn SequenceModel) -> Result<Vec<u8>> {
		Checkpoint { tag: model.type_tag().to_owned(), payload: model.serialize()? }.to_bytes()
	}

	/// Restores a model from bytes produced by [`ModelRegistry::save`].
	///
	/// # Errors
	/// - `Deserialization` if the envelope or payload is malformed
	/// - `UnknownType` if no variant is registered for the tag
	pub fn load(&self, bytes: &[u8]) -> Result<Box<dyn SequenceModel>> {
		let checkpoint = Checkpoint::from_bytes(bytes)?;
		let entry = self
			.entries
			.iter()
			.find(|e| e.tag == checkpoint.tag)
			.ok_or_else(|| ModelError::UnknownType { tag: checkpoint.tag.clone() })?;
		(entry.deserialize)(&checkpoint.payload)
	}

	/// Writes `model` to `path`, replacing the file.
	pub fn save_file<P: AsRef<Path>>(&self, model: &dyn SequenceModel, path: P) -> Result<()> {
		let bytes = self.save(model)?;
		io::overwrite(&path, &bytes)?;
		info!("Saved {} model to {}", model.name(), path.as_ref().display());
		Ok(())
	}

	/// Loads the model stored at `path`, or `None` if there is no such file.
	pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Option<Box<dyn SequenceModel>>> {
		match io::read_if_exists(&path)? {
			Some(bytes) => Ok(Some(self.load(&bytes)?)),
			None => Ok(None),
		}
	}
}
