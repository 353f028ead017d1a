//! Bootloader strategies (spec §4.8 step 5): a closed tag table, one module
//! per strategy, selected by [`crate::context::BootloaderKind`].

mod syslinux;
mod systemd_boot;
mod uboot;

use std::path::Path;

use color_eyre::Result;

use crate::{context::BootloaderKind, partition::PartitionTable};

/// Per-kernel inputs a bootloader strategy needs to write its entries.
#[derive(Debug, Clone)]
pub struct KernelEntry {
	pub name: String,
	pub vmlinuz: String,
	pub initrds: Vec<String>,
	pub fdtdir: Option<String>,
	pub fdt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BootloaderInputs<'a> {
	pub chroot: &'a Path,
	pub target_arch: &'a str,
	pub table: &'a PartitionTable,
	pub kernels: &'a [KernelEntry],
	pub kernel_cmdline: &'a str,
}

/// Dispatches to the selected bootloader strategy (§4.8 step 5).
///
/// # Errors
/// Propagates whatever the selected strategy's installer returns.
pub fn install(kind: BootloaderKind, inputs: &BootloaderInputs<'_>) -> Result<()> {
	match kind {
		BootloaderKind::SystemdBoot => systemd_boot::install(inputs),
		BootloaderKind::Syslinux => syslinux::install(inputs),
		BootloaderKind::UbootExtlinux => uboot::install(inputs),
	}
}
