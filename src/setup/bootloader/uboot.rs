//! u-boot strategy (spec §4.8 step 5, third bullet): only the extlinux
//! config is written; deploying the boot loader binary itself is out of
//! scope.

use std::fs;

use color_eyre::Result;

use super::{syslinux::render_extlinux_cfg, BootloaderInputs};

/// Writes `/boot/extlinux/extlinux.conf`, reusing the same extlinux-grammar
/// renderer as the syslinux strategy.
///
/// # Errors
/// Propagates filesystem errors.
pub fn install(inputs: &BootloaderInputs<'_>) -> Result<()> {
	let dir = inputs.chroot.join("boot/extlinux");
	fs::create_dir_all(&dir)?;
	fs::write(dir.join("extlinux.conf"), render_extlinux_cfg(inputs))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::partition::PartitionTable;
	use uuid::Uuid;

	fn fixed_uuid() -> Uuid {
		Uuid::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10)
	}

	#[test]
	fn writes_only_the_extlinux_config() {
		let decl = "aimager@root: size=1G,type=linux\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let chroot = tempfile::tempdir().unwrap();
		let inputs = BootloaderInputs {
			chroot: chroot.path(),
			target_arch: "aarch64",
			table: &table,
			kernels: &[],
			kernel_cmdline: "",
		};
		install(&inputs).unwrap();
		assert!(chroot.path().join("boot/extlinux/extlinux.conf").exists());
		assert!(!chroot.path().join("boot/EFI").exists());
	}
}
