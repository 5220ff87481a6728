use std::{
	fs,
	path::{Path, PathBuf},
	time::UNIX_EPOCH,
};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// One syncable vault file.
#[derive(Clone, Debug)]
pub struct VaultFile {
	pub path: PathBuf,
	pub mtime_ms: u128,
	pub external_id: String,
}

/// Stable id for a vault file at a point in time; a touched file gets a new
/// id and therefore re-captures.
pub fn external_id(path: &Path, mtime_ms: u128) -> String {
	let mut hasher = Sha256::new();

	hasher.update(path.to_string_lossy().as_bytes());
	hasher.update(b":");
	hasher.update(mtime_ms.to_string().as_bytes());

	format!("{:x}", hasher.finalize())
}

/// Walks a vault directory collecting markdown files modified at or after
/// `since_ms` (when given), sorted by path for stable output.
pub fn collect(root: &Path, since_ms: Option<u128>) -> color_eyre::Result<Vec<VaultFile>> {
	let mut files = Vec::new();

	for entry in WalkDir::new(root).follow_links(false) {
		let entry = entry?;

		if !entry.file_type().is_file() {
			continue;
		}
		if entry.path().extension().and_then(|ext| ext.to_str()) != Some("md") {
			continue;
		}

		let metadata = fs::metadata(entry.path())?;
		let mtime_ms = metadata
			.modified()?
			.duration_since(UNIX_EPOCH)
			.map(|duration| duration.as_millis())
			.unwrap_or(0);

		if let Some(since_ms) = since_ms
			&& mtime_ms < since_ms
		{
			continue;
		}

		files.push(VaultFile {
			external_id: external_id(entry.path(), mtime_ms),
			path: entry.path().to_path_buf(),
			mtime_ms,
		});
	}

	files.sort_by(|a, b| a.path.cmp(&b.path));

	Ok(files)
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;

	#[test]
	fn external_id_is_stable_per_path_and_mtime() {
		let path = Path::new("/vault/daily/2026-02-06.md");

		assert_eq!(external_id(path, 1_000), external_id(path, 1_000));
		assert_ne!(external_id(path, 1_000), external_id(path, 2_000));
		assert_ne!(
			external_id(path, 1_000),
			external_id(Path::new("/vault/daily/2026-02-07.md"), 1_000),
		);
	}

	#[test]
	fn collect_finds_only_markdown() {
		let dir = tempfile::tempdir().expect("tempdir");

		fs::write(dir.path().join("a.md"), "# a").unwrap();
		fs::write(dir.path().join("b.txt"), "b").unwrap();
		fs::create_dir(dir.path().join("sub")).unwrap();
		fs::write(dir.path().join("sub").join("c.md"), "# c").unwrap();

		let files = collect(dir.path(), None).expect("collect");
		let names: Vec<String> = files
			.iter()
			.map(|file| file.path.file_name().unwrap().to_string_lossy().to_string())
			.collect();

		assert_eq!(names, vec!["a.md", "c.md"]);
	}

	#[test]
	fn collect_honors_the_since_cutoff() {
		let dir = tempfile::tempdir().expect("tempdir");

		fs::write(dir.path().join("old.md"), "# old").unwrap();

		let far_future = u128::MAX / 2;
		let files = collect(dir.path(), Some(far_future)).expect("collect");

		assert!(files.is_empty());
	}
}
