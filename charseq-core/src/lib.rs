//! Character-level sequence model training and text generation.
//!
//! This crate provides:
//! - Corpus loading into fixed-size byte samples
//! - Recurrent networks (LSTM, GRU), Markov chains and hidden Markov models
//!   behind one `SequenceModel` interface
//! - A minibatch training loop with truncated backpropagation through time
//! - Temperature-controlled sampling
//! - Tagged checkpoints restored through an explicit registry

/// Tagged checkpoint envelope and the model registry.
pub mod checkpoint;

/// One-hot encoding of bytes over an alphabet.
pub mod codec;

/// Temperature sampling and the step-by-step generation loop.
pub mod decoder;

pub mod error;

/// Model variants and the interface they share.
pub mod model;

/// Corpus scanning and sample sets.
pub mod samples;

pub mod training;

/// I/O utilities (directory listing, whole-file reads and writes).
///
/// Not exposed
pub(crate) mod io;

pub use checkpoint::{Checkpoint, ModelEntry, ModelRegistry};
pub use codec::{Alphabet, OneHotCodec};
pub use decoder::{DecodeOptions, decode, sample_log_index};
pub use error::{ModelError, Result};
pub use model::SequenceModel;
pub use samples::{ChunkConfig, Sample, SampleSet, SampleStore};
pub use training::{CancellationToken, StopReason, TrainStatus, TrainingLoop};
