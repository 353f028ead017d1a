//! Small helpers shared across components: the atomic-write idiom (§3
//! invariant: nothing is ever written in place) and a thin wrapper for
//! shelling out to the external tools `aimager` treats as collaborators.

use std::{
	fs,
	io::Write,
	path::{Path, PathBuf},
	process::Command,
};

use color_eyre::{eyre::eyre, Result, Section};

/// Returns `<path>.temp` for the atomic-write idiom used by every cache
/// and artifact writer in this crate.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
	let mut os = path.as_os_str().to_owned();
	os.push(".temp");
	PathBuf::from(os)
}

/// Writes `contents` to `<path>.temp` then renames it onto `path`.
///
/// # Errors
/// Propagates any I/O failure while writing the temp file or renaming it.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
	let temp = temp_path(path);
	let _ = fs::remove_file(&temp);
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	fs::write(&temp, contents)?;
	fs::rename(&temp, path)?;
	Ok(())
}

/// Like [`write_atomic`] but the content is produced by a fallible closure
/// that writes into the open temp file handle (used for streamed downloads).
pub fn with_atomic_file<F>(path: &Path, f: F) -> Result<()>
where
	F: FnOnce(&mut fs::File) -> Result<()>,
{
	let temp = temp_path(path);
	let _ = fs::remove_file(&temp);
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	let mut file = fs::File::create(&temp)?;
	f(&mut file)?;
	file.flush()?;
	drop(file);
	fs::rename(&temp, path)?;
	Ok(())
}

/// A cache entry is fresh for this run if its mtime is at or after
/// `start_time` (§3 `StartTime` lifecycle).
#[must_use]
pub fn is_fresh(path: &Path, start_time: std::time::SystemTime) -> bool {
	fs::metadata(path).and_then(|m| m.modified()).is_ok_and(|mtime| mtime >= start_time)
}

/// Runs a command to completion, failing with stdout/stderr attached as
/// report sections if it exits non-zero.
///
/// # Errors
/// Returns an error if the process cannot be spawned or exits non-zero.
pub fn run(cmd: &mut Command) -> Result<()> {
	tracing::trace!(?cmd, "running command");
	let out = cmd.output()?;
	if out.status.success() {
		return Ok(());
	}
	let stdout = String::from_utf8_lossy(&out.stdout).trim().to_owned();
	let stderr = String::from_utf8_lossy(&out.stderr).trim().to_owned();
	Err(eyre!("command `{:?}` exited with {}", cmd, out.status))
		.with_section(move || stdout.header("Stdout:"))
		.with_section(move || stderr.header("Stderr:"))
}

/// Downloads `url` into `path`, retrying a fixed number of times with a
/// fixed delay (§5: "three retries... fixed delay of three seconds").
/// Writes to `<path>.temp` then renames, so a failed attempt never leaves a
/// partial file where a caller might find it.
///
/// The network transport itself is out of scope (§1): this shells out to
/// `curl`, the same way the rest of the crate treats `mkfs`/`sfdisk`/etc. as
/// external collaborators.
///
/// # Errors
/// Returns an error if all retries are exhausted.
pub fn fetch_url_to_path(url: &str, path: &Path) -> Result<()> {
	const RETRIES: u32 = 3;
	const DELAY: std::time::Duration = std::time::Duration::from_secs(3);

	let temp = temp_path(path);
	let _ = fs::remove_file(&temp);
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}

	let mut last_err = None;
	for attempt in 1..=RETRIES {
		tracing::debug!(url, attempt, "fetching");
		let status = Command::new("curl")
			.args(["-fL", "--retry-connrefused", "-o"])
			.arg(&temp)
			.arg(url)
			.status();
		match status {
			Ok(s) if s.success() => {
				fs::rename(&temp, path)?;
				return Ok(());
			},
			Ok(s) => {
				let io_err = std::io::Error::other(format!("curl exited with {s}"));
				last_err = Some(crate::error::network_err(url, &temp, io_err));
			},
			Err(e) => last_err = Some(crate::error::network_err(url, &temp, e)),
		}
		if attempt < RETRIES {
			std::thread::sleep(DELAY);
		}
	}
	Err(last_err.map_or_else(|| eyre!("failed to fetch {url}"), Into::into))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn write_atomic_leaves_no_temp_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("out.txt");
		write_atomic(&path, b"hello").unwrap();
		assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
		assert!(!temp_path(&path).exists());
	}

	#[test]
	fn freshness_respects_start_time() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("entry");
		let before = std::time::SystemTime::now();
		fs::write(&path, b"x").unwrap();
		assert!(is_fresh(&path, before));
		let after = before + std::time::Duration::from_secs(3600);
		assert!(!is_fresh(&path, after));
	}
}
