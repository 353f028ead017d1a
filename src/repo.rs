//! Repo Client (spec §4.1): mirror template expansion, repository database
//! fetch/parse, and package resolution/extraction.

use std::{
	collections::BTreeMap,
	fs,
	io::Read,
	path::{Path, PathBuf},
	process::Command,
	time::SystemTime,
};

use color_eyre::Result;

use crate::{
	cache::{already_fetched, CacheLayout},
	error::AimagerError,
	util::fetch_url_to_path,
};

/// Expands a mirror URL template's `$repo`/`$arch` substrings. No other
/// substitutions are performed (§4.1).
#[must_use]
pub fn expand_mirror(template: &str, repo: &str, arch: &str) -> String {
	template.replace("$repo", repo).replace("$arch", arch)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
	pub name: String,
	pub filename: String,
	pub version: String,
}

/// A parsed repository `.db` index: name -> {filename, version} (§3 `RepoDB`).
#[derive(Debug, Clone, Default)]
pub struct RepoDb {
	packages: BTreeMap<String, PackageRecord>,
}

impl RepoDb {
	#[must_use]
	pub fn get(&self, name: &str) -> Option<&PackageRecord> {
		self.packages.get(name)
	}

	/// Parses a repo db tar stream: every entry matching `<name>-*/desc`
	/// contributes one record, each built from the `%FILENAME%`/`%NAME%`/
	/// `%VERSION%` sections (the value is the line right after the header).
	///
	/// # Errors
	/// Returns [`AimagerError::Parsing`] if the three field lists end up
	/// with mismatched lengths for any single desc entry, or if the tar
	/// stream itself can't be read.
	pub fn parse<R: Read>(reader: R) -> Result<Self> {
		let mut archive = tar::Archive::new(reader);
		let mut packages = BTreeMap::new();

		for entry in archive.entries()? {
			let mut entry = entry?;
			let path = entry.path()?.to_string_lossy().into_owned();
			if !path.ends_with("/desc") {
				continue;
			}
			let mut contents = String::new();
			entry.read_to_string(&mut contents)?;
			let record = parse_desc(&contents)?;
			packages.insert(record.name.clone(), record);
		}

		Ok(Self { packages })
	}
}

/// Parses one `desc` file's `%FILENAME%`/`%NAME%`/`%VERSION%` sections.
fn parse_desc(contents: &str) -> Result<PackageRecord> {
	let section = |header: &str| -> Option<String> {
		let mut lines = contents.lines();
		while let Some(line) = lines.next() {
			if line.trim() == header {
				return lines.next().map(str::trim).map(ToOwned::to_owned);
			}
		}
		None
	};

	let filename = section("%FILENAME%");
	let name = section("%NAME%");
	let version = section("%VERSION%");

	match (filename, name, version) {
		(Some(filename), Some(name), Some(version)) => Ok(PackageRecord { name, filename, version }),
		_ => Err(AimagerError::parsing(
			"repo desc record",
			"missing %FILENAME%/%NAME%/%VERSION% section, or lists of mismatched length",
		)
		.into()),
	}
}

pub struct RepoClient<'a> {
	pub cache: &'a CacheLayout,
	pub distro: &'a str,
}

impl<'a> RepoClient<'a> {
	#[must_use]
	pub fn new(cache: &'a CacheLayout, distro: &'a str) -> Self {
		Self { cache, distro }
	}

	/// Fetches (or reuses, if fresh-for-this-run) `<mirror>/<repo>.db`.
	///
	/// # Errors
	/// Propagates download failures after the retry budget is exhausted.
	pub fn fetch_db(
		&self, mirror_template: &str, repo: &str, arch: &str, start_time: SystemTime,
	) -> Result<PathBuf> {
		let path = self.cache.repo_db(self.distro, repo, arch);
		if already_fetched(&path, start_time) {
			tracing::debug!(?path, "repo db already fresh for this run");
			return Ok(path);
		}
		let url = format!("{}/{repo}.db", expand_mirror(mirror_template, repo, arch));
		fetch_url_to_path(&url, &path)?;
		Ok(path)
	}

	/// Parses a previously-fetched db path. Repo `.db` archives are gzip
	/// tars on some mirrors and plain tars on others (newer `repo-add`
	/// defaults to no compression); this sniffs the gzip magic bytes
	/// (`1f 8b`) and transparently decodes either shape.
	///
	/// # Errors
	/// Returns an error if the file can't be opened or is malformed.
	pub fn load_db(db_path: &Path) -> Result<RepoDb> {
		let bytes = fs::read(db_path)?;
		if bytes.starts_with(&[0x1f, 0x8b]) {
			RepoDb::parse(flate2::read::GzDecoder::new(&bytes[..]))
		} else {
			RepoDb::parse(&bytes[..])
		}
	}

	/// Resolves `pkg_name` to its {filename, version, local path}, locating
	/// it in the cache if already downloaded, otherwise fetching it from the
	/// mirror (§4.1 "Package resolution").
	///
	/// # Errors
	/// Returns [`AimagerError::PackageNotFound`] if the name isn't present
	/// in the db, or propagates download failures.
	pub fn resolve_package(
		&self, db: &RepoDb, mirror_template: &str, repo: &str, arch: &str, pkg_name: &str,
	) -> Result<(PackageRecord, PathBuf)> {
		let record = db.get(pkg_name).cloned().ok_or_else(|| AimagerError::PackageNotFound {
			repo: repo.to_owned(),
			name: pkg_name.to_owned(),
		})?;

		let local_path = self.cache.pkg_file(self.distro, repo, arch, &record.filename);
		if local_path.exists() {
			tracing::debug!(?local_path, "package already present locally");
			return Ok((record, local_path));
		}

		let url = format!("{}/{}", expand_mirror(mirror_template, repo, arch), record.filename);
		fetch_url_to_path(&url, &local_path)?;
		Ok((record, local_path))
	}

	/// Extracts a single `path_in_pkg` from a previously-resolved package
	/// archive into `cache/pkg/<...>:<pkgfile-without-ext>/...`. Always
	/// re-extracts (§4.1: "cheap; required file may have changed on
	/// re-resolution").
	///
	/// Package archives are zstd- or xz-compressed; rather than pull in a
	/// decompression crate, this shells out to `bsdtar` (§1 lists it as an
	/// external collaborator alongside `mkfs.fat`/`sfdisk`/etc).
	///
	/// # Errors
	/// Returns an error if `bsdtar` fails or the requested path is absent
	/// from its output.
	pub fn extract_path(
		&self, repo: &str, arch: &str, record: &PackageRecord, local_path: &Path, path_in_pkg: &str,
	) -> Result<PathBuf> {
		let stem = package_stem(&record.filename);
		let dest_dir = self.cache.pkg_extract_dir(self.distro, repo, arch, &stem);
		fs::create_dir_all(&dest_dir)?;

		let dest = dest_dir.join(path_in_pkg);
		if let Some(parent) = dest.parent() {
			fs::create_dir_all(parent)?;
		}

		let mut cmd = Command::new("bsdtar");
		cmd.args(["-xpf"]).arg(local_path).args(["-C"]).arg(&dest_dir).arg(path_in_pkg);
		crate::util::run(&mut cmd)?;

		if !dest.exists() {
			return Err(AimagerError::parsing(
				"package archive",
				format!("`{path_in_pkg}` not found in {}", record.filename),
			)
			.into());
		}
		Ok(dest)
	}
}

/// Strips the package-archive extension (`.pkg.tar.zst`, `.pkg.tar.xz`, ...)
/// to get the directory name that sits alongside the cached package file.
fn package_stem(filename: &str) -> String {
	filename
		.strip_suffix(".pkg.tar.zst")
		.or_else(|| filename.strip_suffix(".pkg.tar.xz"))
		.or_else(|| filename.strip_suffix(".pkg.tar.gz"))
		.or_else(|| filename.strip_suffix(".pkg.tar"))
		.unwrap_or(filename)
		.to_owned()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn expands_repo_and_arch_only() {
		let expanded = expand_mirror("https://mirror/$repo/os/$arch", "core", "x86_64");
		assert_eq!(expanded, "https://mirror/core/os/x86_64");
	}

	#[test]
	fn expansion_ignores_unrelated_dollar_signs() {
		let expanded = expand_mirror("https://mirror/$repo/$other/$arch", "core", "x86_64");
		assert_eq!(expanded, "https://mirror/core/$other/x86_64");
	}

	#[test]
	fn parses_desc_record() {
		let desc = "%FILENAME%\npacman-6.1.0-1-x86_64.pkg.tar.zst\n\n%NAME%\npacman\n\n%VERSION%\n6.1.0-1\n";
		let record = parse_desc(desc).unwrap();
		assert_eq!(record.name, "pacman");
		assert_eq!(record.version, "6.1.0-1");
		assert_eq!(record.filename, "pacman-6.1.0-1-x86_64.pkg.tar.zst");
	}

	#[test]
	fn desc_missing_a_section_is_rejected() {
		let desc = "%FILENAME%\npacman-6.1.0-1-x86_64.pkg.tar.zst\n\n%NAME%\npacman\n";
		assert!(parse_desc(desc).is_err());
	}

	#[test]
	fn package_stem_strips_known_extensions() {
		assert_eq!(package_stem("pacman-6.1.0-1-x86_64.pkg.tar.zst"), "pacman-6.1.0-1-x86_64");
		assert_eq!(package_stem("foo-1-1-any.pkg.tar.xz"), "foo-1-1-any");
	}

	#[test]
	fn resolve_package_returns_package_not_found() {
		let db = RepoDb::default();
		let dir = tempfile::tempdir().unwrap();
		let cache = CacheLayout::new(dir.path());
		let client = RepoClient::new(&cache, "archlinux");
		let err = client
			.resolve_package(&db, "https://mirror/$repo/os/$arch", "core", "x86_64", "nonexistent")
			.unwrap_err();
		assert!(err.to_string().contains("not found"));
	}
}
