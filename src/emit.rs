//! Emitter (spec §4.9): the artifact registry and one writer per
//! `--create` target. Every artifact writes to `<out>.temp` and renames on
//! success, and the registry makes re-requesting the same target within one
//! run a no-op.

use std::{
	collections::BTreeSet,
	fs,
	path::{Path, PathBuf},
	process::Command,
};

use color_eyre::Result;

use crate::{
	context::CreateTarget,
	error::AimagerError,
	partition::{PartitionTable, Role},
	util::run,
};

/// Tracks which targets have already been produced this run, so repeated
/// entries in `--create` do no extra work (§4.9 first paragraph, §5
/// "Artifact emission ... idempotent within a run via the artifact
/// registry").
#[derive(Debug, Default)]
pub struct ArtifactRegistry {
	done: BTreeSet<CreateTarget>,
	root_tar_path: Option<PathBuf>,
}

impl ArtifactRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn already_emitted(&self, target: CreateTarget) -> bool {
		self.done.contains(&target)
	}

	fn mark_done(&mut self, target: CreateTarget, path: &Path) {
		self.done.insert(target);
		if target == CreateTarget::RootTar {
			self.root_tar_path = Some(path.to_path_buf());
		}
	}
}

/// Emits every target in `targets`, in caller order, skipping ones already
/// produced this run.
///
/// # Errors
/// Propagates the first emitter failure.
pub fn emit_all(
	registry: &mut ArtifactRegistry, targets: &[CreateTarget], chroot: &Path, table: &PartitionTable,
	out_prefix: &Path, mkfs_args: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
	for &target in targets {
		if registry.already_emitted(target) {
			tracing::debug!(?target, "artifact already emitted this run, skipping");
			continue;
		}
		let out_path = PathBuf::from(format!("{}{}", out_prefix.display(), target.file_name()));
		match target {
			CreateTarget::RootTar => emit_root_tar(chroot, &out_path)?,
			CreateTarget::PartBootImg => emit_part_boot_img(chroot, table, &out_path)?,
			CreateTarget::PartRootImg => emit_part_root_img(chroot, table, &out_path, mkfs_args)?,
			CreateTarget::PartHomeImg => emit_part_home_img(chroot, table, &out_path, mkfs_args)?,
			CreateTarget::DiskImg => emit_disk_img(chroot, table, &out_path, out_prefix, mkfs_args)?,
			CreateTarget::KeyringHelperTar => emit_keyring_helper_tar(chroot, registry, &out_path)?,
		}
		registry.mark_done(target, &out_path);
	}
	Ok(())
}

/// `root.tar`: tar of the chroot excluding `/dev /mnt /proc /sys` and
/// transient gpg sockets.
fn emit_root_tar(chroot: &Path, out_path: &Path) -> Result<()> {
	crate::util::with_atomic_file(out_path, |file| {
		let mut builder = tar::Builder::new(file);
		builder.follow_symlinks(false);
		for entry in walkdir::WalkDir::new(chroot).min_depth(1) {
			let entry = entry.map_err(|e| AimagerError::parsing("chroot walk", e.to_string()))?;
			let rel = entry.path().strip_prefix(chroot).expect("walked under chroot");
			if is_excluded_from_root_tar(rel) {
				continue;
			}
			if entry.file_type().is_dir() {
				builder.append_dir(rel, entry.path())?;
			} else if entry.file_type().is_symlink() {
				let target = fs::read_link(entry.path())?;
				let mut header = tar::Header::new_gnu();
				header.set_entry_type(tar::EntryType::Symlink);
				header.set_size(0);
				header.set_mode(0o777);
				builder.append_link(&mut header, rel, &target)?;
			} else {
				let mut file = fs::File::open(entry.path())?;
				builder.append_file(rel, &mut file)?;
			}
		}
		builder.finish()?;
		Ok(())
	})
}

fn is_excluded_from_root_tar(rel: &Path) -> bool {
	let Some(first) = rel.components().next() else { return false };
	let first = first.as_os_str().to_string_lossy();
	if matches!(first.as_ref(), "dev" | "mnt" | "proc" | "sys") {
		return true;
	}
	rel.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("S."))
}

/// `part-boot.img`: a FAT image sized from the declared boot partition,
/// pre-populated with `/boot/*` via `mcopy -os`, reusing a bootloader-stage
/// seed image if one already exists.
fn emit_part_boot_img(chroot: &Path, table: &PartitionTable, out_path: &Path) -> Result<()> {
	let boot = table.get(Role::Boot).ok_or_else(|| AimagerError::configuration("no boot partition declared"))?;
	let seed = chroot.join("../build-scratch/boot-seed.img");
	if seed.exists() {
		fs::copy(&seed, out_path)?;
		return Ok(());
	}

	let temp = crate::util::temp_path(out_path);
	let mut truncate = Command::new("truncate");
	truncate.args(["-s", &(boot.size_mib * 1024 * 1024).to_string()]).arg(&temp);
	run(&mut truncate)?;

	let mut mkfs = Command::new("mkfs.fat");
	mkfs.args(["-i", &boot.fat_volume_id().replace('-', "")]).arg(&temp);
	run(&mut mkfs)?;

	let boot_dir = chroot.join("boot");
	if boot_dir.is_dir() {
		let sources: Vec<PathBuf> =
			fs::read_dir(&boot_dir)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
		if !sources.is_empty() {
			let mut mcopy = Command::new("mcopy");
			mcopy.args(["-i"]).arg(&temp).args(["-os"]).args(&sources).arg("::/");
			run(&mut mcopy)?;
		}
	}

	fs::rename(&temp, out_path)?;
	Ok(())
}

/// Shared logic for `part-root.img`/`part-home.img`: build an ext4 image
/// from a chroot subtree, with a given set of subtrees shadowed by empty
/// tmpfs mounts so they contribute no data.
fn emit_ext4_image(
	source_dir: &Path, size_mib: u64, shadow_subdirs: &[&str], out_path: &Path, extra_mkfs_arg: Option<&str>,
) -> Result<()> {
	let temp = crate::util::temp_path(out_path);
	let mut truncate = Command::new("truncate");
	truncate.args(["-s", &(size_mib * 1024 * 1024).to_string()]).arg(&temp);
	run(&mut truncate)?;

	for sub in shadow_subdirs {
		let dir = source_dir.join(sub);
		if dir.is_dir() {
			let empty = tempfile::tempdir()?;
			let mut bind = Command::new("mount");
			bind.args(["--bind"]).arg(empty.path()).arg(&dir);
			run(&mut bind)?;
		}
	}

	let mut mkfs = Command::new("mkfs.ext4");
	mkfs.args(["-d"]).arg(source_dir).arg(&temp);
	if let Some(arg) = extra_mkfs_arg {
		mkfs.arg(arg);
	}
	run(&mut mkfs)?;

	fs::rename(&temp, out_path)?;
	Ok(())
}

fn emit_part_root_img(
	chroot: &Path, table: &PartitionTable, out_path: &Path,
	mkfs_args: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
	let root = table.get(Role::Root).ok_or_else(|| AimagerError::configuration("no root partition declared"))?;
	let mut shadow = vec!["dev", "mnt", "proc", "sys"];
	if table.get(Role::Boot).is_some() {
		shadow.push("boot");
	}
	if table.get(Role::Home).is_some() {
		shadow.push("home");
	}
	emit_ext4_image(chroot, root.size_mib, &shadow, out_path, mkfs_args.get("root").map(String::as_str))
}

fn emit_part_home_img(
	chroot: &Path, table: &PartitionTable, out_path: &Path,
	mkfs_args: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
	let home = table.get(Role::Home).ok_or_else(|| AimagerError::configuration("no home partition declared"))?;
	emit_ext4_image(&chroot.join("home"), home.size_mib, &[], out_path, mkfs_args.get("home").map(String::as_str))
}

/// `disk.img`: truncate to total disk size, apply the table via `sfdisk`,
/// then `dd` each role's image in at its partition offset.
fn emit_disk_img(
	chroot: &Path, table: &PartitionTable, out_path: &Path, out_prefix: &Path,
	mkfs_args: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
	let temp = crate::util::temp_path(out_path);
	let mut truncate = Command::new("truncate");
	truncate.args(["-s", &(table.disk_size_mib() * 1024 * 1024).to_string()]).arg(&temp);
	run(&mut truncate)?;

	let declaration = render_sfdisk_dump(table);
	let mut sfdisk = Command::new("sfdisk");
	sfdisk.arg(&temp);
	sfdisk.stdin(std::process::Stdio::piped());
	let mut child = sfdisk.spawn()?;
	if let Some(mut stdin) = child.stdin.take() {
		use std::io::Write;
		stdin.write_all(declaration.as_bytes())?;
	}
	let status = child.wait()?;
	if !status.success() {
		return Err(AimagerError::subprocess("sfdisk", status).into());
	}

	for partition in &table.partitions {
		let part_out = PathBuf::from(format!("{}part-{}.img", out_prefix.display(), partition.role));
		let mut registry = ArtifactRegistry::new();
		let target = match partition.role {
			Role::Boot => Some(CreateTarget::PartBootImg),
			Role::Root => Some(CreateTarget::PartRootImg),
			Role::Home => Some(CreateTarget::PartHomeImg),
			Role::Swap => None,
		};
		if let Some(target) = target {
			emit_all(&mut registry, &[target], chroot, table, out_prefix, mkfs_args)?;
			let mut dd = Command::new("dd");
			dd.arg(format!("if={}", part_out.display()))
				.arg(format!("of={}", temp.display()))
				.args(["bs=1M", &format!("seek={}", partition.offset_mib), "conv=notrunc"]);
			run(&mut dd)?;
		}
	}

	fs::rename(&temp, out_path)?;
	Ok(())
}

fn render_sfdisk_dump(table: &PartitionTable) -> String {
	let mut out = format!("label: {}\n", if table.label == crate::partition::Label::Gpt { "gpt" } else { "dos" });
	for partition in &table.partitions {
		out.push_str(&format!(
			"start={}MiB, size={}MiB\n",
			partition.offset_mib, partition.size_mib
		));
	}
	out
}

/// `keyring-helper.tar`: the subset of the chroot the keyring-helper borrow
/// set needs (§4.7). Reuses `root.tar` as its source if it was already
/// produced this run, instead of re-walking the chroot.
fn emit_keyring_helper_tar(chroot: &Path, registry: &ArtifactRegistry, out_path: &Path) -> Result<()> {
	const BORROW_SET: &[&str] = &[
		"bin",
		"etc/pacman.conf",
		"etc/pacman.d",
		"lib",
		"lib64",
		"usr/bin",
		"usr/lib/getconf",
		"usr/share/makepkg",
	];

	if let Some(root_tar) = &registry.root_tar_path {
		return filter_tar(root_tar, out_path, BORROW_SET);
	}

	crate::util::with_atomic_file(out_path, |file| {
		let mut builder = tar::Builder::new(file);
		for entry_path in BORROW_SET {
			let full = chroot.join(entry_path);
			if !full.exists() {
				continue;
			}
			if full.is_dir() {
				builder.append_dir_all(entry_path, &full)?;
			} else {
				let mut file = fs::File::open(&full)?;
				builder.append_file(entry_path, &mut file)?;
			}
		}
		builder.finish()?;
		Ok(())
	})
}

fn filter_tar(source: &Path, out_path: &Path, borrow_set: &[&str]) -> Result<()> {
	crate::util::with_atomic_file(out_path, |file| {
		let mut builder = tar::Builder::new(file);
		let reader = fs::File::open(source)?;
		let mut archive = tar::Archive::new(reader);
		for entry in archive.entries()? {
			let mut entry = entry?;
			let path = entry.path()?.to_string_lossy().into_owned();
			if !borrow_set.iter().any(|p| path == *p || path.starts_with(&format!("{p}/"))) {
				continue;
			}
			let mut header = entry.header().clone();
			let data_path = path.clone();
			let mut buf = Vec::new();
			std::io::copy(&mut entry, &mut buf)?;
			builder.append_data(&mut header, data_path, std::io::Cursor::new(buf))?;
		}
		builder.finish()?;
		Ok(())
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn excludes_dev_mnt_proc_sys_and_gpg_sockets() {
		assert!(is_excluded_from_root_tar(Path::new("dev/null")));
		assert!(is_excluded_from_root_tar(Path::new("mnt/helper")));
		assert!(is_excluded_from_root_tar(Path::new("proc/1/status")));
		assert!(is_excluded_from_root_tar(Path::new("sys/module")));
		assert!(is_excluded_from_root_tar(Path::new("etc/pacman.d/gnupg/S.gpg-agent")));
		assert!(!is_excluded_from_root_tar(Path::new("etc/pacman.conf")));
	}

	#[test]
	fn registry_skips_already_emitted_targets() {
		let mut registry = ArtifactRegistry::new();
		assert!(!registry.already_emitted(CreateTarget::RootTar));
		registry.mark_done(CreateTarget::RootTar, Path::new("/out/root.tar"));
		assert!(registry.already_emitted(CreateTarget::RootTar));
		assert_eq!(registry.root_tar_path.as_deref(), Some(Path::new("/out/root.tar")));
	}

	#[test]
	fn sfdisk_dump_contains_one_line_per_partition() {
		let decl = "label: gpt\naimager@boot: size=512M,type=uefi\naimager@root: size=4G,type=linux\n";
		let table = PartitionTable::parse(decl, uuid::Uuid::new_v4).unwrap();
		let dump = render_sfdisk_dump(&table);
		assert!(dump.contains("label: gpt"));
		assert_eq!(dump.lines().count(), 3);
	}
}
