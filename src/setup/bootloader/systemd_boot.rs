//! systemd-boot strategy (spec §4.8 step 5, first bullet).

use std::fs;

use color_eyre::Result;

use super::BootloaderInputs;
use crate::{error::AimagerError, partition::Role};

/// Maps a target architecture to the `BOOT<ARCH>.EFI` stub name systemd-boot
/// expects at the well-known EFI fallback path.
fn efi_arch_tag(target_arch: &str) -> Result<&'static str> {
	match target_arch {
		"x86_64" => Ok("X64"),
		"aarch64" => Ok("AA64"),
		a if a.starts_with('i') && a.ends_with("86") => Ok("IA32"),
		"armv7h" => Ok("ARM"),
		"riscv64" => Ok("RISCV64"),
		other => Err(AimagerError::configuration(format!("no systemd-boot EFI stub mapping for arch `{other}`")).into()),
	}
}

/// Installs systemd-boot: copies the prebuilt EFI stub, writes
/// `loader/entries.srel`, a random seed, `loader.conf`, and one entry per
/// kernel.
///
/// # Errors
/// Propagates filesystem errors or an unknown target architecture.
pub fn install(inputs: &BootloaderInputs<'_>) -> Result<()> {
	let boot = inputs.chroot.join("boot");
	let arch_tag = efi_arch_tag(inputs.target_arch)?;

	let stub_src =
		inputs.chroot.join("usr/lib/systemd/boot/efi").join(format!("systemd-boot{}.efi", arch_tag.to_lowercase()));
	let stub_dst = boot.join("EFI/BOOT").join(format!("BOOT{arch_tag}.EFI"));
	fs::create_dir_all(stub_dst.parent().expect("has parent"))?;
	if !stub_src.exists() {
		return Err(AimagerError::configuration(format!(
			"systemd-boot EFI stub not found at {} (is the `systemd` package installed?)",
			stub_src.display()
		))
		.into());
	}
	fs::copy(&stub_src, &stub_dst)?;

	let loader_dir = boot.join("loader");
	fs::create_dir_all(loader_dir.join("entries"))?;
	fs::write(loader_dir.join("entries.srel"), b"type1\n")?;
	fs::write(loader_dir.join("random-seed"), random_bytes(32))?;

	let default_entry = inputs.kernels.first().map_or_else(|| "default".to_owned(), |k| format!("{}.conf", k.name));
	fs::write(
		loader_dir.join("loader.conf"),
		format!("default {default_entry}\ntimeout 3\n"),
	)?;

	let root_uuid = inputs
		.table
		.get(Role::Root)
		.map(|p| p.uuid.hyphenated().to_string())
		.ok_or_else(|| AimagerError::configuration("systemd-boot requires a root partition"))?;

	for kernel in inputs.kernels {
		let mut body = format!("title   {}\nlinux   /{}\n", kernel.name, kernel.vmlinuz);
		for initrd in &kernel.initrds {
			body.push_str(&format!("initrd  /{initrd}\n"));
		}
		if let Some(fdtdir) = &kernel.fdtdir {
			body.push_str(&format!("fdtdir  /{fdtdir}\n"));
		}
		if let Some(fdt) = &kernel.fdt {
			body.push_str(&format!("fdt     /{fdt}\n"));
		}
		body.push_str(&format!(
			"options root=UUID={root_uuid} rw{}\n",
			if inputs.kernel_cmdline.is_empty() { String::new() } else { format!(" {}", inputs.kernel_cmdline) }
		));
		fs::write(loader_dir.join("entries").join(format!("{}.conf", kernel.name)), body)?;
	}

	Ok(())
}

fn random_bytes(len: usize) -> Vec<u8> {
	use uuid::Uuid;
	let mut out = Vec::with_capacity(len);
	while out.len() < len {
		out.extend_from_slice(Uuid::new_v4().as_bytes());
	}
	out.truncate(len);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_known_architectures() {
		assert_eq!(efi_arch_tag("x86_64").unwrap(), "X64");
		assert_eq!(efi_arch_tag("aarch64").unwrap(), "AA64");
		assert_eq!(efi_arch_tag("i686").unwrap(), "IA32");
		assert_eq!(efi_arch_tag("armv7h").unwrap(), "ARM");
		assert_eq!(efi_arch_tag("riscv64").unwrap(), "RISCV64");
	}

	#[test]
	fn rejects_unknown_architecture() {
		assert!(efi_arch_tag("m68k").is_err());
	}

	#[test]
	fn random_seed_is_requested_length() {
		assert_eq!(random_bytes(32).len(), 32);
	}
}
