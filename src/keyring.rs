//! Bootstrap & Keyring Manager (spec §4.7): either reuses a prebuilt root
//! archive, or drives a fresh pacman bootstrap and keyring initialization
//! with a deterministic, content-addressed keyring cache.

use std::{
	fs,
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
	process::Command,
};

use color_eyre::Result;
use md5::{Digest, Md5};
use nix::mount::{mount, MsFlags};
use walkdir::WalkDir;

use crate::{cache::CacheLayout, error::AimagerError, util::run};

/// Extracts a previously-built root archive into `chroot`, preserving ACLs
/// and extended attributes via GNU tar's own xattr handling, then (for
/// cross-arch builds, or whenever `--binfmt-check` forces it) verifies the
/// emulator-backed binary-format handler with a minimal smoke test (§4.7
/// "Reuse").
///
/// # Errors
/// Propagates extraction or smoke-test failures.
pub fn reuse_root_archive(archive: &Path, chroot: &Path, run_smoke_test: bool) -> Result<()> {
	fs::create_dir_all(chroot)?;
	let mut cmd = Command::new("tar");
	cmd.args(["--acls", "--xattrs", "-xpf"]).arg(archive).args(["-C"]).arg(chroot);
	run(&mut cmd)?;

	if run_smoke_test {
		smoke_test(chroot)?;
	}
	Ok(())
}

/// Runs `chroot <chroot> true` to confirm the target-arch binary-format
/// handler (e.g. `binfmt_misc` + an emulator) is wired correctly.
///
/// # Errors
/// Returns an error if the chroot'd process fails to run or exits non-zero.
pub fn smoke_test(chroot: &Path) -> Result<()> {
	let mut cmd = Command::new("chroot");
	cmd.arg(chroot).arg("true");
	run(&mut cmd)
}

/// Invokes the host package manager with the loose config to install the
/// base group plus every repo's keyring packages (§4.7 fresh-bootstrap
/// step 1).
///
/// # Errors
/// Propagates a non-zero pacman exit.
pub fn install_base_and_keyrings(pacman_bin: &Path, loose_config: &Path, packages: &[String]) -> Result<()> {
	let mut cmd = Command::new(pacman_bin);
	cmd.args(["--config"]).arg(loose_config).args(["-Sy", "--noconfirm"]).args(packages);
	run(&mut cmd)
}

/// Computes `keyring-id = "md5-" + md5(...)` over a tar of
/// `usr/share/pacman/keyrings` inside `chroot`, with every entry's
/// owner/group/mtime normalized to root/root/epoch-0 so the id is stable
/// across runs and hosts (§4.7 fresh-bootstrap step 2).
///
/// # Errors
/// Propagates filesystem walk or tar-building failures.
pub fn compute_keyring_id(chroot: &Path) -> Result<String> {
	let keyrings_dir = chroot.join("usr/share/pacman/keyrings");
	let mut builder = tar::Builder::new(Vec::new());

	let mut entries: Vec<_> = WalkDir::new(&keyrings_dir)
		.min_depth(1)
		.into_iter()
		.collect::<std::result::Result<_, _>>()
		.map_err(|e| AimagerError::parsing("keyrings directory walk", e.to_string()))?;
	entries.sort_by(|a, b| a.path().cmp(b.path()));

	for entry in entries {
		let rel = entry.path().strip_prefix(&keyrings_dir).expect("walked under keyrings_dir");
		let metadata = entry.metadata()?;
		let mut header = tar::Header::new_gnu();
		header.set_mode(metadata.permissions().mode());
		header.set_uid(0);
		header.set_gid(0);
		header.set_mtime(0);

		if metadata.is_dir() {
			header.set_entry_type(tar::EntryType::Directory);
			header.set_size(0);
			builder.append_data(&mut header, rel, std::io::empty())?;
		} else {
			header.set_size(metadata.len());
			let file = fs::File::open(entry.path())?;
			builder.append_data(&mut header, rel, file)?;
		}
	}

	let bytes = builder.into_inner()?;
	let digest = Md5::digest(&bytes);
	let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
	Ok(format!("md5-{hex}"))
}

/// If `cache/keyring/<keyring-id>.tar` exists, extracts it over
/// `<chroot>/etc/pacman.d/gnupg`. Returns whether a cached keyring was found
/// (§4.7 fresh-bootstrap step 3, first clause).
///
/// # Errors
/// Propagates extraction failures.
pub fn restore_cached_keyring(cache: &CacheLayout, keyring_id: &str, chroot: &Path) -> Result<bool> {
	let backup = cache.keyring_backup(keyring_id);
	if !backup.exists() {
		return Ok(false);
	}
	let dest = chroot.join("etc/pacman.d/gnupg");
	fs::create_dir_all(&dest)?;
	let file = fs::File::open(&backup)?;
	tar::Archive::new(file).unpack(&dest)?;
	Ok(true)
}

/// Initializes and populates the target distribution's keyring by chrooting
/// directly into the (emulated, cross-arch-slow) target chroot (§4.7
/// fresh-bootstrap step 3, no-keyring-helper branch).
///
/// # Errors
/// Propagates non-zero exits from either step.
pub fn init_keyring_in_chroot(chroot: &Path, gpg_init_cmd: &[&str], gpg_populate_cmd: &[&str]) -> Result<()> {
	run_in_chroot(chroot, gpg_init_cmd)?;
	run_in_chroot(chroot, gpg_populate_cmd)?;
	Ok(())
}

fn run_in_chroot(chroot: &Path, argv: &[&str]) -> Result<()> {
	let (program, rest) = argv.split_first().ok_or_else(|| AimagerError::configuration("empty chroot command"))?;
	let mut cmd = Command::new("chroot");
	cmd.arg(chroot).arg(program).args(rest);
	run(&mut cmd)
}

/// Keyring-helper bind-mount borrow path (§4.7 fresh-bootstrap step 3,
/// keyring-helper branch): extracts the native-arch helper tree into
/// `<chroot>/mnt`, bind-mounts the target's /dev, /proc,
/// /etc/pacman.d/gnupg, and /usr/share/pacman/keyrings over it, then runs
/// keyring init/populate inside `/mnt` (native-arch binaries, no emulator
/// cost).
///
/// # Errors
/// Propagates extraction, mount(2), or chroot-exec failures.
pub fn init_keyring_with_helper(
	chroot: &Path, helper_archive: &Path, gpg_init_cmd: &[&str], gpg_populate_cmd: &[&str],
) -> Result<()> {
	let mnt = chroot.join("mnt");
	fs::create_dir_all(&mnt)?;

	let mut cmd = Command::new("tar");
	cmd.args(["--acls", "--xattrs", "-xpf"]).arg(helper_archive).args(["-C"]).arg(&mnt).args([
		"bin",
		"etc/pacman*",
		"lib*",
		"usr/bin",
		"usr/lib/getconf",
		"usr/lib/*.so*",
		"usr/share/makepkg",
	]);
	run(&mut cmd)?;

	for (src, dst) in [
		("dev", "dev"),
		("proc", "proc"),
		("etc/pacman.d/gnupg", "etc/pacman.d/gnupg"),
		("usr/share/pacman/keyrings", "usr/share/pacman/keyrings"),
	] {
		let src_path = chroot.join(src);
		let dst_path = mnt.join(dst);
		fs::create_dir_all(&dst_path)?;
		mount(Some(&src_path), &dst_path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
			.map_err(|e| AimagerError::namespace(format!("bind {src} into helper mnt failed: {e}")))?;
	}

	run_in_chroot(&mnt, gpg_init_cmd)?;
	run_in_chroot(&mnt, gpg_populate_cmd)?;
	Ok(())
}

/// Archives `<chroot>/etc/pacman.d/gnupg`, excluding ephemeral sockets named
/// `S.*`, to `cache/keyring/<keyring-id>.tar` via temp+rename (§4.7
/// fresh-bootstrap step 3, last bullet).
///
/// # Errors
/// Propagates filesystem walk or tar-building failures.
pub fn backup_keyring(cache: &CacheLayout, keyring_id: &str, chroot: &Path) -> Result<PathBuf> {
	let gnupg_dir = chroot.join("etc/pacman.d/gnupg");
	let dest = cache.keyring_backup(keyring_id);

	crate::util::with_atomic_file(&dest, |file| {
		let mut builder = tar::Builder::new(file);
		for entry in WalkDir::new(&gnupg_dir).min_depth(1) {
			let entry = entry.map_err(|e| AimagerError::parsing("gnupg directory walk", e.to_string()))?;
			let name = entry.file_name().to_string_lossy();
			if name.starts_with("S.") {
				continue;
			}
			let rel = entry.path().strip_prefix(&gnupg_dir).expect("walked under gnupg_dir");
			if entry.file_type().is_dir() {
				builder.append_dir(rel, entry.path())?;
			} else {
				let mut file = fs::File::open(entry.path())?;
				builder.append_file(rel, &mut file)?;
			}
		}
		builder.finish()?;
		Ok(())
	})?;
	Ok(dest)
}

/// Re-downloads the full bootstrap package set using the strict config with
/// `--downloadonly`, so everything just received is signature-verified
/// against the now-initialized keyring (§4.7 fresh-bootstrap step 4).
///
/// # Errors
/// Propagates a non-zero pacman exit.
pub fn verify_with_strict_redownload(pacman_bin: &Path, strict_config: &Path, packages: &[String]) -> Result<()> {
	let mut cmd = Command::new(pacman_bin);
	cmd.args(["--config"])
		.arg(strict_config)
		.args(["-Sw", "--noconfirm", "--downloadonly"])
		.args(packages);
	run(&mut cmd)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keyring_id_is_stable_across_identical_trees() {
		let root_a = tempfile::tempdir().unwrap();
		let root_b = tempfile::tempdir().unwrap();
		for root in [&root_a, &root_b] {
			let dir = root.path().join("usr/share/pacman/keyrings");
			fs::create_dir_all(&dir).unwrap();
			fs::write(dir.join("archlinux.gpg"), b"fake keyring bytes").unwrap();
		}
		let id_a = compute_keyring_id(root_a.path()).unwrap();
		let id_b = compute_keyring_id(root_b.path()).unwrap();
		assert_eq!(id_a, id_b);
		assert!(id_a.starts_with("md5-"));
	}

	#[test]
	fn keyring_id_changes_with_content() {
		let root = tempfile::tempdir().unwrap();
		let dir = root.path().join("usr/share/pacman/keyrings");
		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join("a.gpg"), b"one").unwrap();
		let id_one = compute_keyring_id(root.path()).unwrap();
		fs::write(dir.join("a.gpg"), b"two").unwrap();
		let id_two = compute_keyring_id(root.path()).unwrap();
		assert_ne!(id_one, id_two);
	}

	#[test]
	fn restore_returns_false_when_no_backup_cached() {
		let dir = tempfile::tempdir().unwrap();
		let cache = CacheLayout::new(dir.path());
		let chroot = tempfile::tempdir().unwrap();
		assert!(!restore_cached_keyring(&cache, "md5-none", chroot.path()).unwrap());
	}

	#[test]
	fn backup_excludes_ephemeral_sockets() {
		let work = tempfile::tempdir().unwrap();
		let cache = CacheLayout::new(work.path());
		let chroot = tempfile::tempdir().unwrap();
		let gnupg = chroot.path().join("etc/pacman.d/gnupg");
		fs::create_dir_all(&gnupg).unwrap();
		fs::write(gnupg.join("pubring.gpg"), b"keys").unwrap();
		fs::write(gnupg.join("S.gpg-agent"), b"socket-ish").unwrap();

		let archive_path = backup_keyring(&cache, "md5-test", chroot.path()).unwrap();
		let contents = fs::read(&archive_path).unwrap();
		let mut archive = tar::Archive::new(std::io::Cursor::new(contents));
		let names: Vec<String> = archive
			.entries()
			.unwrap()
			.map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
			.collect();
		assert!(names.iter().any(|n| n.contains("pubring.gpg")));
		assert!(!names.iter().any(|n| n.contains("S.gpg-agent")));
	}
}
