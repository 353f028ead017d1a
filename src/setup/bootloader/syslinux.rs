//! syslinux strategy (spec §4.8 step 5, second bullet): requires a dos
//! label and a dedicated boot partition.

use std::{fs, process::Command};

use color_eyre::Result;

use super::BootloaderInputs;
use crate::{
	error::AimagerError,
	partition::{Label, Role},
	util::run,
};

const MBR_STAGE_BYTES: u64 = 440;

/// Installs syslinux: stamps `mbr.bin`'s first 440 bytes into the build's
/// `head.img`, builds a FAT seed image pre-populated with `syslinux/*.c32`,
/// runs the installer against it, and writes an extlinux config alongside.
///
/// # Errors
/// Returns [`AimagerError::Configuration`] if the table isn't a dos label
/// with a dedicated boot partition, or propagates subprocess/I/O failures.
pub fn install(inputs: &BootloaderInputs<'_>) -> Result<()> {
	if inputs.table.label != Label::Dos {
		return Err(AimagerError::configuration("syslinux requires a dos partition label").into());
	}
	let boot = inputs
		.table
		.get(Role::Boot)
		.ok_or_else(|| AimagerError::configuration("syslinux requires a dedicated boot partition"))?;

	let build_scratch = inputs.chroot.join("../build-scratch");
	fs::create_dir_all(&build_scratch)?;
	let head_img = build_scratch.join("head.img");
	let mbr_bin = inputs.chroot.join("usr/lib/syslinux/mbr.bin");

	stamp_mbr_stage(&mbr_bin, &head_img)?;

	let seed_img = build_scratch.join("boot-seed.img");
	let seed_size_bytes = boot.size_mib * 1024 * 1024;
	let mut truncate = Command::new("truncate");
	truncate.args(["-s", &seed_size_bytes.to_string()]).arg(&seed_img);
	run(&mut truncate)?;

	let mut mkfs = Command::new("mkfs.fat");
	mkfs.arg(&seed_img);
	run(&mut mkfs)?;

	let c32_dir = inputs.chroot.join("usr/lib/syslinux/bios");
	if c32_dir.is_dir() {
		for entry in fs::read_dir(&c32_dir)? {
			let entry = entry?;
			if entry.path().extension().is_some_and(|e| e == "c32") {
				let mut mcopy = Command::new("mcopy");
				mcopy.args(["-i"]).arg(&seed_img).arg(entry.path()).arg("::/");
				run(&mut mcopy)?;
			}
		}
	}

	let mut extlinux_install = Command::new("syslinux");
	extlinux_install.arg(&seed_img);
	run(&mut extlinux_install)?;

	let extlinux_cfg = render_extlinux_cfg(inputs);
	fs::write(build_scratch.join("extlinux.conf"), extlinux_cfg)?;

	Ok(())
}

fn stamp_mbr_stage(mbr_bin: &std::path::Path, head_img: &std::path::Path) -> Result<()> {
	let mut dd = Command::new("dd");
	dd.arg(format!("if={}", mbr_bin.display()))
		.arg(format!("of={}", head_img.display()))
		.args(["bs=1", &format!("count={MBR_STAGE_BYTES}"), "conv=notrunc"]);
	run(&mut dd)
}

/// Shared with [`super::uboot`]: both strategies end up writing an
/// extlinux-grammar config, syslinux's with a `LABEL`/`APPEND` per kernel.
pub(super) fn render_extlinux_cfg(inputs: &BootloaderInputs<'_>) -> String {
	let root_uuid =
		inputs.table.get(Role::Root).map(|p| p.uuid.hyphenated().to_string()).unwrap_or_default();
	let mut cfg = String::from("DEFAULT linux\nTIMEOUT 30\n\n");
	for kernel in inputs.kernels {
		cfg.push_str(&format!("LABEL {}\n  KERNEL /{}\n", kernel.name, kernel.vmlinuz));
		if let Some(initrd) = kernel.initrds.first() {
			cfg.push_str(&format!("  INITRD /{initrd}\n"));
		}
		cfg.push_str(&format!(
			"  APPEND root=UUID={root_uuid} rw{}\n\n",
			if inputs.kernel_cmdline.is_empty() { String::new() } else { format!(" {}", inputs.kernel_cmdline) }
		));
	}
	cfg
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{partition::PartitionTable, setup::bootloader::KernelEntry};
	use uuid::Uuid;

	fn fixed_uuid() -> Uuid {
		Uuid::from_u128(0xdead_beef_dead_beef_dead_beef_dead_beef)
	}

	#[test]
	fn rejects_gpt_label() {
		let decl = "label: gpt\naimager@boot: size=100M,type=uefi\naimager@root: size=1G,type=linux\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let chroot = tempfile::tempdir().unwrap();
		let inputs = BootloaderInputs {
			chroot: chroot.path(),
			target_arch: "x86_64",
			table: &table,
			kernels: &[],
			kernel_cmdline: "",
		};
		assert!(install(&inputs).is_err());
	}

	#[test]
	fn extlinux_config_includes_kernel_entry() {
		let decl = "aimager@boot: size=100M,type=linux\naimager@root: size=1G,type=linux\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let kernels = vec![KernelEntry {
			name: "linux".into(),
			vmlinuz: "vmlinuz-linux".into(),
			initrds: vec!["initramfs-linux.img".into()],
			fdtdir: None,
			fdt: None,
		}];
		let chroot = tempfile::tempdir().unwrap();
		let inputs = BootloaderInputs {
			chroot: chroot.path(),
			target_arch: "x86_64",
			table: &table,
			kernels: &kernels,
			kernel_cmdline: "quiet",
		};
		let cfg = render_extlinux_cfg(&inputs);
		assert!(cfg.contains("LABEL linux"));
		assert!(cfg.contains("APPEND root=UUID="));
		assert!(cfg.contains("quiet"));
	}
}
