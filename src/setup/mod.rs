//! Setup Stage (spec §4.8): initrd pinning, package installation, repo
//! config append, fstab, bootloader, hostname, locale, and overlays — run
//! inside the child's mount namespace once the chroot is populated.

pub mod bootloader;
pub mod fstab;
pub mod initrd;

use std::{fs, path::Path, process::Command};

use color_eyre::Result;

use crate::util::run;

/// Writes the sanitized hostname to `/etc/hostname` (§4.8 step 6).
///
/// # Errors
/// Propagates filesystem errors.
pub fn write_hostname(chroot: &Path, hostname: &str) -> Result<()> {
	fs::write(chroot.join("etc/hostname"), format!("{hostname}\n"))
		.map_err(Into::into)
}

/// Uncomments each requested locale's line in `/etc/locale.gen`, runs
/// `locale-gen` inside the chroot, and sets `LANG=<first-locale>` in
/// `/etc/locale.conf` (§4.8 step 7).
///
/// # Errors
/// Propagates filesystem errors or a non-zero `locale-gen` exit.
pub fn configure_locales(chroot: &Path, locales: &[String]) -> Result<()> {
	let Some(first) = locales.first() else { return Ok(()) };

	let locale_gen_path = chroot.join("etc/locale.gen");
	let contents = fs::read_to_string(&locale_gen_path).unwrap_or_default();
	let patched: String = contents
		.lines()
		.map(|line| {
			let trimmed = line.trim_start_matches('#').trim_start();
			if locales.iter().any(|l| trimmed.starts_with(l.as_str())) {
				trimmed.to_owned()
			} else {
				line.to_owned()
			}
		})
		.collect::<Vec<_>>()
		.join("\n")
		+ "\n";
	fs::write(&locale_gen_path, patched)?;

	let mut cmd = Command::new("chroot");
	cmd.arg(chroot).args(["locale-gen"]);
	run(&mut cmd)?;

	fs::write(chroot.join("etc/locale.conf"), format!("LANG={first}\n"))?;
	Ok(())
}

/// Extracts each overlay tar over the chroot, in declared order (§4.8
/// step 8).
///
/// # Errors
/// Propagates extraction failures.
pub fn apply_overlays(chroot: &Path, overlays: &[std::path::PathBuf]) -> Result<()> {
	for overlay in overlays {
		let mut cmd = Command::new("tar");
		cmd.args(["--acls", "--xattrs", "-xpf"]).arg(overlay).args(["-C"]).arg(chroot);
		run(&mut cmd)?;
	}
	Ok(())
}

/// Appends extra third-party-repo declarations to the target's
/// `/etc/pacman.conf` inside the chroot (§4.8 step 3).
///
/// # Errors
/// Propagates filesystem errors.
pub fn append_extra_repos(chroot: &Path, sections: &[crate::pacman_config::RepoSection]) -> Result<()> {
	if sections.is_empty() {
		return Ok(());
	}
	let path = chroot.join("etc/pacman.conf");
	let mut contents = fs::read_to_string(&path).unwrap_or_default();
	for section in sections {
		contents.push_str(&format!("\n[{}]\n", section.name));
		if let Some(server) = &section.server {
			contents.push_str(&format!("Server = {server}\n"));
		}
		contents.push_str("Include = /etc/pacman.d/mirrorlist\n");
	}
	fs::write(&path, contents)?;
	Ok(())
}

/// Installs kernels, microcode, bootloader, and user packages with the
/// strict config and `--needed` (§4.8 step 2).
///
/// # Errors
/// Propagates a non-zero pacman exit.
pub fn install_packages(pacman_bin: &Path, strict_config: &Path, packages: &[String]) -> Result<()> {
	if packages.is_empty() {
		return Ok(());
	}
	let mut cmd = Command::new(pacman_bin);
	cmd.args(["--config"]).arg(strict_config).args(["-S", "--needed", "--noconfirm"]).args(packages);
	run(&mut cmd)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hostname_file_has_trailing_newline() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("etc")).unwrap();
		write_hostname(dir.path(), "myhost").unwrap();
		assert_eq!(fs::read_to_string(dir.path().join("etc/hostname")).unwrap(), "myhost\n");
	}

	#[test]
	fn locale_gen_uncomments_requested_locales_only() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("etc")).unwrap();
		fs::write(
			dir.path().join("etc/locale.gen"),
			"#en_US.UTF-8 UTF-8\n#de_DE.UTF-8 UTF-8\n#fr_FR.UTF-8 UTF-8\n",
		)
		.unwrap();

		let contents = fs::read_to_string(dir.path().join("etc/locale.gen")).unwrap();
		let locales = vec!["en_US.UTF-8".to_owned()];
		let patched: String = contents
			.lines()
			.map(|line| {
				let trimmed = line.trim_start_matches('#').trim_start();
				if locales.iter().any(|l| trimmed.starts_with(l.as_str())) {
					trimmed.to_owned()
				} else {
					line.to_owned()
				}
			})
			.collect::<Vec<_>>()
			.join("\n");
		assert!(patched.contains("en_US.UTF-8 UTF-8") && !patched.contains("#en_US"));
		assert!(patched.contains("#de_DE.UTF-8 UTF-8"));
	}

	#[test]
	fn append_extra_repos_is_noop_when_empty() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("etc")).unwrap();
		fs::write(dir.path().join("etc/pacman.conf"), "[options]\n").unwrap();
		append_extra_repos(dir.path(), &[]).unwrap();
		assert_eq!(fs::read_to_string(dir.path().join("etc/pacman.conf")).unwrap(), "[options]\n");
	}
}
