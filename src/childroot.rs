//! Child Root Builder (spec §4.6): constructs the rootfs mount tree inside
//! the namespaced child before any package manager invocation happens.

use std::{
	fs,
	os::unix::fs::{symlink, PermissionsExt},
	path::{Path, PathBuf},
};

use color_eyre::Result;
use nix::mount::{mount, MsFlags};

use crate::error::AimagerError;

const SKELETON_DIRS: &[&str] = &[
	"boot",
	"dev",
	"dev/shm",
	"dev/pts",
	"etc/pacman.d",
	"proc",
	"run",
	"sys",
	"sys/module",
	"tmp",
	"var/cache/pacman/pkg",
	"var/lib/pacman",
	"var/log",
];

const DEVICE_NODES: &[&str] = &["full", "null", "random", "tty", "urandom", "zero"];

fn mount_err(what: &str, source: nix::Error) -> color_eyre::Report {
	AimagerError::namespace(format!("mount {what} failed: {source}")).into()
}

/// Mounts a tmpfs at the chroot root with caller-supplied options, or (if
/// none given) bind-mounts the chroot path onto itself so that subtree
/// mounts underneath it stay visible (§4.6 first bullet).
///
/// # Errors
/// Propagates any mount(2) failure.
pub fn mount_root(chroot: &Path, tmpfs_opts: Option<&str>) -> Result<()> {
	fs::create_dir_all(chroot)?;
	if let Some(opts) = tmpfs_opts {
		mount(
			Some("tmpfs"),
			chroot,
			Some("tmpfs"),
			MsFlags::empty(),
			Some(opts),
		)
		.map_err(|e| mount_err("tmpfs at chroot root", e))?;
	} else {
		mount(Some(chroot), chroot, None::<&str>, MsFlags::MS_BIND, None::<&str>)
			.map_err(|e| mount_err("bind chroot onto itself", e))?;
	}
	Ok(())
}

/// Creates the fixed directory skeleton under `chroot` (§4.6 second
/// bullet).
///
/// # Errors
/// Propagates filesystem errors.
pub fn create_skeleton(chroot: &Path) -> Result<()> {
	for dir in SKELETON_DIRS {
		fs::create_dir_all(chroot.join(dir))?;
	}
	Ok(())
}

/// Mounts `/dev` and `/sys` tmpfs, bind-mounts the standard device nodes,
/// and mounts proc/devpts (§4.6 third bullet).
///
/// # Errors
/// Propagates any mount(2) failure.
pub fn mount_pseudo_filesystems(chroot: &Path) -> Result<()> {
	let dev = chroot.join("dev");
	let sys = chroot.join("sys");
	let proc = chroot.join("proc");
	let devpts = dev.join("pts");

	mount(Some("tmpfs"), &dev, Some("tmpfs"), MsFlags::MS_NOSUID, Some("mode=0755"))
		.map_err(|e| mount_err("tmpfs at /dev", e))?;
	mount(Some("tmpfs"), &sys, Some("tmpfs"), MsFlags::MS_NOSUID, Some("mode=0755"))
		.map_err(|e| mount_err("tmpfs at /sys", e))?;

	for node in DEVICE_NODES {
		let host_node = Path::new("/dev").join(node);
		let target = dev.join(node);
		if !target.exists() {
			fs::write(&target, [])?;
		}
		mount(Some(&host_node), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
			.map_err(|e| mount_err(&format!("bind /dev/{node}"), e))?;
	}

	mount(Some("proc"), &proc, Some("proc"), MsFlags::empty(), None::<&str>)
		.map_err(|e| mount_err("mount proc", e))?;
	mount(Some("devpts"), &devpts, Some("devpts"), MsFlags::empty(), None::<&str>)
		.map_err(|e| mount_err("mount devpts", e))?;

	Ok(())
}

/// Creates the standard set of `/dev` symlinks (§4.6 fourth bullet). The
/// console target is resolved from the calling process's own controlling
/// terminal, falling back to `/dev/console` if none is attached (e.g. when
/// run under a CI harness with no tty).
///
/// # Errors
/// Propagates filesystem errors other than "symlink already exists".
pub fn create_symlinks(chroot: &Path) -> Result<()> {
	let dev = chroot.join("dev");
	let console_target = resolve_console_path();

	let links: [(&str, PathBuf); 7] = [
		("stderr", PathBuf::from("/proc/self/fd/2")),
		("stdout", PathBuf::from("/proc/self/fd/1")),
		("stdin", PathBuf::from("/proc/self/fd/0")),
		("core", PathBuf::from("/proc/kcore")),
		("fd", PathBuf::from("/proc/self/fd")),
		("ptmx", PathBuf::from("pts/ptmx")),
		("console", console_target),
	];

	for (name, target) in links {
		let link = dev.join(name);
		let _ = fs::remove_file(&link);
		symlink(&target, &link)?;
	}
	Ok(())
}

fn resolve_console_path() -> PathBuf {
	for candidate in ["/dev/tty", "/proc/self/fd/0"] {
		if let Ok(resolved) = fs::read_link(candidate) {
			return resolved;
		}
	}
	PathBuf::from("/dev/console")
}

/// Applies the fixed permission bits from §4.6's fifth bullet: 1777 on
/// `/dev/shm` and `/tmp`, 555 on `/proc` and `/sys`.
///
/// # Errors
/// Propagates filesystem errors.
pub fn apply_permissions(chroot: &Path) -> Result<()> {
	set_mode(&chroot.join("dev/shm"), 0o1777)?;
	set_mode(&chroot.join("tmp"), 0o1777)?;
	set_mode(&chroot.join("proc"), 0o555)?;
	set_mode(&chroot.join("sys"), 0o555)?;
	Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
	fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
	Ok(())
}

/// Runs the whole Child Root Builder procedure in §4.6's order.
///
/// # Errors
/// Propagates the first failure from any stage.
pub fn build(chroot: &Path, tmpfs_opts: Option<&str>) -> Result<()> {
	mount_root(chroot, tmpfs_opts)?;
	create_skeleton(chroot)?;
	mount_pseudo_filesystems(chroot)?;
	create_symlinks(chroot)?;
	apply_permissions(chroot)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn skeleton_creates_every_declared_directory() {
		let dir = tempfile::tempdir().unwrap();
		create_skeleton(dir.path()).unwrap();
		for sub in SKELETON_DIRS {
			assert!(dir.path().join(sub).is_dir(), "missing {sub}");
		}
	}

	#[test]
	fn console_resolution_never_panics_without_a_tty() {
		// Exercises the pure fallback path; CI/sandboxes rarely have /dev/tty.
		let _ = resolve_console_path();
	}
}
