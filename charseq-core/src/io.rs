use std::path::{Path, PathBuf};
use std::{fs, io};

/// Prefix of entries skipped while scanning a corpus directory.
pub(crate) const HIDDEN_PREFIX: char = '.';

/// Lists the regular, non-hidden files of a directory, sorted by name.
///
/// Subdirectories are ignored. Returns full paths.
pub(crate) fn list_files<P: AsRef<Path>>(dir: P) -> io::Result<Vec<PathBuf>> {
	let mut files = Vec::new();

	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		let hidden = entry.file_name().to_string_lossy().starts_with(HIDDEN_PREFIX);
		if hidden {
			continue;
		}

		let path = entry.path();
		if path.is_file() {
			files.push(path);
		}
	}

	files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
	Ok(files)
}

/// Reads a whole file, returning `None` when it does not exist.
pub(crate) fn read_if_exists<P: AsRef<Path>>(path: P) -> io::Result<Option<Vec<u8>>> {
	match fs::read(path) {
		Ok(bytes) => Ok(Some(bytes)),
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(err),
	}
}

/// Writes `bytes` to `path`, replacing any previous content.
///
/// No journaling: a crash mid-write leaves a truncated file.
pub(crate) fn overwrite<P: AsRef<Path>>(path: P, bytes: &[u8]) -> io::Result<()> {
	fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn list_files_skips_hidden_entries_and_directories() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("b.txt"), b"b").unwrap();
		fs::write(dir.path().join("a.txt"), b"a").unwrap();
		fs::write(dir.path().join(".hidden"), b"h").unwrap();
		fs::create_dir(dir.path().join("nested")).unwrap();

		let names: Vec<String> = list_files(dir.path())
			.unwrap()
			.iter()
			.map(|p| p.file_name().unwrap().to_string_lossy().to_string())
			.collect();

		assert_eq!(names, vec!["a.txt", "b.txt"]);
	}

	#[test]
	fn read_if_exists_reports_missing_files_as_none() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("model.bin");
		assert!(read_if_exists(&path).unwrap().is_none());

		overwrite(&path, b"first").unwrap();
		overwrite(&path, b"2nd").unwrap();
		assert_eq!(read_if_exists(&path).unwrap().unwrap(), b"2nd");
	}
}
