use std::fs;
use std::hash::Hasher;
use std::ops::{Deref, Range};
use std::path::Path;
use std::sync::Arc;

use log::info;
use rand::Rng;
use rustc_hash::FxHasher;

use crate::error::{ModelError, Result};
use crate::io;

/// Default number of bytes per training sample.
pub const TEXT_CHUNK_SIZE: usize = 1 << 10;

/// Environment variable overriding the chunk size.
pub const CHUNK_SIZE_VAR: &str = "TEXT_CHUNK_SIZE";

/// Environment variable enabling head-only mode when set to a non-empty value.
pub const HEAD_ONLY_VAR: &str = "TEXT_CHUNK_HEAD_ONLY";

/// A chunk of source text used as one training sample.
///
/// Immutable and reference-counted, so slicing or shuffling a
/// [`SampleSet`] never copies the bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample(Arc<[u8]>);

impl Sample {
	pub fn new(bytes: &[u8]) -> Self {
		Self(Arc::from(bytes))
	}

	pub fn bytes(&self) -> &[u8] {
		&self.0
	}

	/// Stable position of this sample in `[0, 1)`, derived from its content.
	fn hash_fraction(&self) -> f64 {
		let mut hasher = FxHasher::default();
		hasher.write(&self.0);
		hasher.write_usize(self.0.len());
		(hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
	}
}

impl Deref for Sample {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		&self.0
	}
}

/// Ordered collection of samples.
///
/// # Invariants
/// - Every sample holds at least one byte
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleSet {
	samples: Vec<Sample>,
}

impl SampleSet {
	/// Builds a set from `samples`, dropping empty ones.
	pub fn new(samples: Vec<Sample>) -> Self {
		Self { samples: samples.into_iter().filter(|s| !s.is_empty()).collect() }
	}

	/// Builds a set from byte strings, one sample per entry.
	pub fn from_bytes<I, B>(items: I) -> Self
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		Self::new(items.into_iter().map(|b| Sample::new(b.as_ref())).collect())
	}

	pub fn len(&self) -> usize {
		self.samples.len()
	}

	pub fn is_empty(&self) -> bool {
		self.samples.is_empty()
	}

	pub fn get(&self, index: usize) -> Option<&Sample> {
		self.samples.get(index)
	}

	/// Length in bytes of the sample at `index`.
	pub fn len_at(&self, index: usize) -> Option<usize> {
		self.samples.get(index).map(|s| s.len())
	}

	/// Total number of bytes over all samples.
	pub fn total_bytes(&self) -> usize {
		self.samples.iter().map(|s| s.len()).sum()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Sample> {
		self.samples.iter()
	}

	pub fn as_slice(&self) -> &[Sample] {
		&self.samples
	}

	/// Returns the samples in `range` as a new set sharing the same bytes.
	pub fn slice(&self, range: Range<usize>) -> SampleSet {
		Self::new(self.samples[range].to_vec())
	}

	pub fn swap(&mut self, i: usize, j: usize) {
		self.samples.swap(i, j);
	}

	/// In-place Fisher-Yates shuffle built on [`SampleSet::swap`].
	pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
		for i in (1..self.len()).rev() {
			let j = rng.random_range(0..=i);
			self.swap(i, j);
		}
	}

	/// Sorts the samples in `range` by length, shortest first.
	pub fn sort_range_by_len(&mut self, range: Range<usize>) {
		self.samples[range].sort_by_key(|s| s.len());
	}

	/// Splits the set into `(validation, training)`.
	///
	/// A sample goes to validation when its content hash falls below
	/// `ratio`, so repeated runs over the same corpus validate on the
	/// same subset. Relative order is preserved on both sides.
	///
	/// The hash is `FxHasher`, which folds into a `usize` and may change
	/// between `rustc-hash` releases: the split is only reproducible for a
	/// given target pointer width and `rustc-hash` version.
	pub fn hash_split(&self, ratio: f64) -> (SampleSet, SampleSet) {
		let (validation, training): (Vec<Sample>, Vec<Sample>) = self
			.samples
			.iter()
			.cloned()
			.partition(|s| s.hash_fraction() < ratio);
		(Self::new(validation), Self::new(training))
	}
}

impl FromIterator<Sample> for SampleSet {
	fn from_iter<T: IntoIterator<Item = Sample>>(iter: T) -> Self {
		Self::new(iter.into_iter().collect())
	}
}

/// How corpus files are cut into samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
	/// Maximum bytes per sample (the last chunk of a file may be shorter).
	pub chunk_size: usize,
	/// Keep only the first chunk of every file.
	pub head_only: bool,
}

impl Default for ChunkConfig {
	fn default() -> Self {
		Self { chunk_size: TEXT_CHUNK_SIZE, head_only: false }
	}
}

impl ChunkConfig {
	/// Reads `TEXT_CHUNK_SIZE` and `TEXT_CHUNK_HEAD_ONLY` from the process environment.
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Builds the configuration from an arbitrary variable lookup.
	///
	/// # Errors
	/// Returns `InvalidOption` if the chunk size is not a positive integer.
	pub fn from_lookup<F>(lookup: F) -> Result<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut config = Self::default();

		if let Some(value) = lookup(CHUNK_SIZE_VAR).filter(|v| !v.is_empty()) {
			config.chunk_size = match value.trim().parse::<usize>() {
				Ok(size) if size > 0 => size,
				_ => {
					return Err(ModelError::InvalidOption(format!(
						"Invalid {} value: {}",
						CHUNK_SIZE_VAR, value
					)));
				}
			};
		}

		config.head_only = lookup(HEAD_ONLY_VAR).is_some_and(|v| !v.is_empty());
		Ok(config)
	}
}

/// Scans corpus directories into sample sets.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleStore {
	config: ChunkConfig,
}

impl SampleStore {
	pub fn new(config: ChunkConfig) -> Self {
		Self { config }
	}

	pub fn config(&self) -> ChunkConfig {
		self.config
	}

	/// Reads every non-hidden file of `dir` and cuts it into samples.
	///
	/// Files are visited in name order, chunks in file order. Empty
	/// files contribute no sample.
	///
	/// # Errors
	/// Returns `Io` if the directory cannot be listed or a file cannot be read.
	pub fn load<P: AsRef<Path>>(&self, dir: P) -> Result<SampleSet> {
		let folder = dir.as_ref();
		let mut samples = Vec::new();

		for path in io::list_files(folder)? {
			let contents = fs::read(&path)?;
			samples.extend(self.chunk(&contents));
		}

		let set = SampleSet::new(samples);
		info!(
			"Loaded {} samples ({} bytes) from {}",
			set.len(),
			set.total_bytes(),
			folder.display()
		);
		Ok(set)
	}

	/// Cuts one file's contents into consecutive chunks.
	pub fn chunk(&self, contents: &[u8]) -> Vec<Sample> {
		let chunks = contents.chunks(self.config.chunk_size).map(Sample::new);
		if self.config.head_only {
			chunks.take(1).collect()
		} else {
			chunks.collect()
		}
	}
}
