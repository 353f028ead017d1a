//! Host Package Manager Bootstrap (spec §4.2): locates a `pacman` binary
//! usable on the *host*, or fetches a statically linked one from the
//! `archlinuxcn` third-party repo when the host doesn't ship the target
//! distribution's package-manager format natively (e.g. building Arch
//! Linux images from a non-Arch host, or cross-arch where the host's own
//! `pacman` can't run).

use std::path::PathBuf;

use color_eyre::Result;

use crate::{cache::CacheLayout, repo::RepoClient};

const ARCHLINUXCN_REPO: &str = "archlinuxcn";
const ARCHLINUXCN_MIRROR: &str = "https://repo.archlinuxcn.org/$arch";
const STATIC_PACKAGE: &str = "pacman-static";
const STATIC_BINARY_PATH: &str = "usr/bin/pacman-static";

/// Returns the system `pacman` binary if one is on `PATH`.
fn system_pacman() -> Option<PathBuf> {
	std::env::var_os("PATH").and_then(|paths| {
		std::env::split_paths(&paths).map(|dir| dir.join("pacman")).find(|p| p.is_file())
	})
}

/// Resolves the host-side pacman binary to invoke, per §4.2: use the host's
/// own `pacman` unless `force_static` was requested or none is present, in
/// which case fetch+extract a static build for `host_arch` from
/// `archlinuxcn` (only {x86_64, aarch64} ship one). `freeze` skips
/// re-fetching if a local copy already exists.
///
/// # Errors
/// Returns an error if a static build doesn't exist for `host_arch`, or
/// propagates download/extraction failures.
pub fn resolve(
	cache: &CacheLayout, distro: &str, host_arch: &str, force_static: bool, freeze: bool,
	start_time: std::time::SystemTime,
) -> Result<PathBuf> {
	if !force_static {
		if let Some(system) = system_pacman() {
			tracing::debug!(?system, "using host's own pacman binary");
			return Ok(system);
		}
	}

	let extract_dir = cache.pkg_extract_dir(distro, ARCHLINUXCN_REPO, host_arch, STATIC_PACKAGE);
	let cached_binary = extract_dir.join(STATIC_BINARY_PATH);
	if freeze && cached_binary.exists() {
		tracing::debug!(?cached_binary, "reusing frozen pacman-static");
		return Ok(cached_binary);
	}

	let client = RepoClient::new(cache, distro);
	let db_path = client.fetch_db(ARCHLINUXCN_MIRROR, ARCHLINUXCN_REPO, host_arch, start_time)?;
	let db = RepoClient::load_db(&db_path)?;
	let (record, local_path) =
		client.resolve_package(&db, ARCHLINUXCN_MIRROR, ARCHLINUXCN_REPO, host_arch, STATIC_PACKAGE)?;
	client.extract_path(ARCHLINUXCN_REPO, host_arch, &record, &local_path, STATIC_BINARY_PATH)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn finds_pacman_on_path_when_present() {
		let dir = tempfile::tempdir().unwrap();
		let fake = dir.path().join("pacman");
		std::fs::write(&fake, b"").unwrap();
		let mut perms = std::fs::metadata(&fake).unwrap().permissions();
		std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
		std::fs::set_permissions(&fake, perms).unwrap();

		let saved = std::env::var_os("PATH");
		// SAFETY: test is single-threaded with respect to this env var and
		// restores it before returning.
		unsafe { std::env::set_var("PATH", dir.path()) };
		let found = system_pacman();
		if let Some(p) = saved {
			unsafe { std::env::set_var("PATH", p) };
		}
		assert_eq!(found, Some(fake));
	}

	#[test]
	fn extract_dir_path_is_keyed_by_distro_repo_arch() {
		let work = tempfile::tempdir().unwrap();
		let cache = CacheLayout::new(work.path());
		let dir = cache.pkg_extract_dir("archlinux", ARCHLINUXCN_REPO, "x86_64", STATIC_PACKAGE);
		assert!(dir.ends_with("archlinux:archlinuxcn:x86_64:pacman-static"));
	}

}
