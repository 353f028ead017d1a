//! Board preset table (spec §9 redesign flag: closed tag table replacing
//! the bash script's `board_*` prefix dispatch). Unlike a distro preset,
//! a board preset is a pure transform over an already-resolved
//! [`BuildContext`] — it narrows architecture/bootloader/kernel choices,
//! it never invents a distro.

use color_eyre::Result;

use crate::{
	context::{BootloaderKind, BuildContext},
	error::AimagerError,
};

struct BoardPreset {
	tag: &'static str,
	description: &'static str,
	apply: fn(BuildContext) -> BuildContext,
}

const PRESETS: &[BoardPreset] = &[
	BoardPreset {
		tag: "generic",
		description: "No board-specific overrides; a plain systemd-boot EFI image.",
		apply: |mut ctx| {
			ctx.board = "generic".to_owned();
			if ctx.bootloaders.is_empty() {
				ctx.bootloaders.push(BootloaderKind::SystemdBoot);
			}
			ctx
		},
	},
	BoardPreset {
		tag: "aarch64_uefi",
		description: "Generic aarch64 EFI target: cross-built from x86_64, gpt boot+root table, systemd-boot.",
		apply: |mut ctx| {
			ctx.board = "aarch64_uefi".to_owned();
			ctx.target_arch = "aarch64".to_owned();
			if ctx.bootloaders.is_empty() {
				ctx.bootloaders.push(BootloaderKind::SystemdBoot);
			}
			if ctx.kernels.is_empty() {
				ctx.kernels.push("linux".to_owned());
			}
			if ctx.table.partitions.is_empty() {
				if let Some(decl) = crate::partition::preset("efi_generic") {
					if let Ok(table) = crate::partition::PartitionTable::parse(decl, uuid::Uuid::new_v4) {
						ctx.table = table;
					}
				}
			}
			ctx
		},
	},
	BoardPreset {
		tag: "rpi4",
		description: "Raspberry Pi 4: aarch64, u-boot-extlinux, linux-rpi kernel.",
		apply: |mut ctx| {
			ctx.board = "rpi4".to_owned();
			ctx.target_arch = "aarch64".to_owned();
			ctx.bootloaders = vec![BootloaderKind::UbootExtlinux];
			if ctx.kernels.is_empty() {
				ctx.kernels.push("linux-rpi".to_owned());
			}
			ctx
		},
	},
	BoardPreset {
		tag: "pinebook-pro",
		description: "Pinebook Pro: aarch64, u-boot-extlinux, linux kernel.",
		apply: |mut ctx| {
			ctx.board = "pinebook-pro".to_owned();
			ctx.target_arch = "aarch64".to_owned();
			ctx.bootloaders = vec![BootloaderKind::UbootExtlinux];
			if ctx.kernels.is_empty() {
				ctx.kernels.push("linux".to_owned());
			}
			ctx
		},
	},
];

/// Applies a board preset tag's transform to `ctx`.
///
/// # Errors
/// Returns [`AimagerError::Configuration`] if the tag isn't in the table.
pub fn apply(tag: &str, ctx: BuildContext) -> Result<BuildContext> {
	let preset = PRESETS
		.iter()
		.find(|p| p.tag == tag)
		.ok_or_else(|| AimagerError::configuration(format!("unknown --board `{tag}`; try --board help")))?;
	Ok((preset.apply)(ctx))
}

#[must_use]
pub fn tags() -> Vec<&'static str> {
	PRESETS.iter().map(|p| p.tag).collect()
}

#[must_use]
pub fn describe(tag: &str) -> Option<&'static str> {
	PRESETS.iter().find(|p| p.tag == tag).map(|p| p.description)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::presets::distro;

	#[test]
	fn rpi4_forces_aarch64_and_uboot() {
		let ctx = distro::resolve("archlinuxarm").unwrap();
		let ctx = apply("rpi4", ctx).unwrap();
		assert_eq!(ctx.target_arch, "aarch64");
		assert_eq!(ctx.bootloaders, vec![BootloaderKind::UbootExtlinux]);
		assert!(ctx.kernels.contains(&"linux-rpi".to_owned()));
	}

	#[test]
	fn generic_defaults_to_systemd_boot_without_clobbering_an_existing_choice() {
		let mut ctx = distro::resolve("archlinux").unwrap();
		ctx.bootloaders.push(BootloaderKind::Syslinux);
		let ctx = apply("generic", ctx).unwrap();
		assert_eq!(ctx.bootloaders, vec![BootloaderKind::Syslinux]);
	}

	#[test]
	fn rejects_unknown_board() {
		let ctx = distro::resolve("archlinux").unwrap();
		assert!(apply("not-a-board", ctx).is_err());
	}

	#[test]
	fn aarch64_uefi_cross_builds_with_a_gpt_boot_root_table() {
		let ctx = distro::resolve("archlinux").unwrap();
		let ctx = apply("aarch64_uefi", ctx).unwrap();
		assert_eq!(ctx.target_arch, "aarch64");
		assert_eq!(ctx.bootloaders, vec![BootloaderKind::SystemdBoot]);
		assert_eq!(ctx.table.label, crate::partition::Label::Gpt);
		assert!(ctx.table.get(crate::partition::Role::Boot).is_some());
		assert!(ctx.table.get(crate::partition::Role::Root).is_some());
	}
}
