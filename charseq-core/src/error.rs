use std::io;

/// Errors raised by sample loading, training, generation and checkpoints.
///
/// Every variant is fatal for the caller: nothing in the crate retries.
/// Interrupting a training run is not an error and is reported through
/// [`crate::training::StopReason`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
	#[error("IO error: {0}")]
	Io(#[from] io::Error),

	#[error("Deserialization error: {0}")]
	Deserialization(String),

	#[error("Serialization error: {0}")]
	Serialization(String),

	#[error("No deserializer registered for type tag {tag:?}")]
	UnknownType { tag: String },

	#[error("No such model: {0}")]
	UnknownModel(String),

	#[error("Invalid state: {0}")]
	InvalidState(String),

	#[error("Invalid option: {0}")]
	InvalidOption(String),

	#[error("Symbol {symbol} is outside the {alphabet}-symbol alphabet")]
	InvalidSymbol { symbol: u8, alphabet: usize },

	#[error("Tensor error: {0}")]
	Tensor(#[from] candle_core::Error),
}

impl From<clap::Error> for ModelError {
	fn from(err: clap::Error) -> Self {
		ModelError::InvalidOption(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, ModelError>;
