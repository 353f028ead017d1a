//! Content-addressed cache directories (spec §3 `CacheLayout`, §4.1).
//!
//! Nothing here ever writes in place: every entry is produced via
//! [`crate::util::write_atomic`]/[`crate::util::fetch_url_to_path`], and
//! freshness for "already fetched this run" is the `mtime >= StartTime`
//! predicate (§3 `StartTime`).

use std::{
	path::{Path, PathBuf},
	time::SystemTime,
};

use crate::util::is_fresh;

/// `cache/` under the working directory, with the directory accessors
/// described by §3's `CacheLayout`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
	root: PathBuf,
}

impl CacheLayout {
	#[must_use]
	pub fn new(work_dir: &Path) -> Self {
		Self { root: work_dir.join("cache") }
	}

	#[must_use]
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// `cache/repo/<distro>:<repo>:<arch>.db`
	#[must_use]
	pub fn repo_db(&self, distro: &str, repo: &str, arch: &str) -> PathBuf {
		self.root.join("repo").join(format!("{distro}:{repo}:{arch}.db"))
	}

	/// `cache/pkg/<distro>:<repo>:<arch>:<pkgfile>`
	#[must_use]
	pub fn pkg_file(&self, distro: &str, repo: &str, arch: &str, pkgfile: &str) -> PathBuf {
		self.root.join("pkg").join(format!("{distro}:{repo}:{arch}:{pkgfile}"))
	}

	/// `cache/pkg/<distro>:<repo>:<arch>:<pkgfile-without-ext>/...`, the
	/// extraction directory sibling to a downloaded package.
	#[must_use]
	pub fn pkg_extract_dir(&self, distro: &str, repo: &str, arch: &str, pkg_stem: &str) -> PathBuf {
		self.root.join("pkg").join(format!("{distro}:{repo}:{arch}:{pkg_stem}"))
	}

	/// `cache/keyring/<id>.tar`
	#[must_use]
	pub fn keyring_backup(&self, keyring_id: &str) -> PathBuf {
		self.root.join("keyring").join(format!("{keyring_id}.tar"))
	}

	/// `cache/build.<build-id>/{bin,etc,root}`
	#[must_use]
	pub fn build_scratch(&self, build_id: &str) -> PathBuf {
		self.root.join(format!("build.{build_id}"))
	}
}

/// Is `path` already fetched for this run? (§3 `StartTime` lifecycle,
/// §8 "cache idempotence": repeated resolutions of the same input must not
/// cause additional network fetches after the first.)
#[must_use]
pub fn already_fetched(path: &Path, start_time: SystemTime) -> bool {
	path.exists() && is_fresh(path, start_time)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn layout_paths_match_spec_shape() {
		let layout = CacheLayout::new(Path::new("/work"));
		assert_eq!(
			layout.repo_db("archlinux", "core", "x86_64"),
			PathBuf::from("/work/cache/repo/archlinux:core:x86_64.db")
		);
		assert_eq!(
			layout.pkg_file("archlinux", "core", "x86_64", "pacman-6.1.0-1-x86_64.pkg.tar.zst"),
			PathBuf::from("/work/cache/pkg/archlinux:core:x86_64:pacman-6.1.0-1-x86_64.pkg.tar.zst")
		);
		assert_eq!(
			layout.keyring_backup("md5-deadbeef"),
			PathBuf::from("/work/cache/keyring/md5-deadbeef.tar")
		);
	}

	#[test]
	fn freshness_gate_matches_mtime_predicate() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("archlinux:core:x86_64.db");
		let before = SystemTime::now();
		std::fs::write(&path, b"db").unwrap();
		assert!(already_fetched(&path, before));
		assert!(!already_fetched(&path, before + std::time::Duration::from_secs(60)));
		assert!(!already_fetched(&dir.path().join("missing"), before));
	}
}
