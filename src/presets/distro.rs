//! Distro preset table (spec §9 redesign flag: replaces the bash script's
//! `distro_*` function-name-prefix dispatch with a closed tag table).
//!
//! Each entry is a plain function building the distro-specific slice of a
//! [`BuildContext`]: display name, default architecture, base mirror
//! templates, and the keyring packages each first-party repo needs trusted
//! before anything can be installed from it.

use std::collections::BTreeMap;

use color_eyre::Result;

use crate::{
	context::{BuildContext, Distro},
	error::AimagerError,
};

/// One distro preset's resolved fragment, folded into a fresh
/// [`BuildContext`] by [`resolve`].
struct DistroPreset {
	tag: &'static str,
	display_name: &'static str,
	default_arch: &'static str,
	mirror_template: &'static str,
	keyring_packages: &'static [&'static str],
	description: &'static str,
}

const PRESETS: &[DistroPreset] = &[
	DistroPreset {
		tag: "archlinux",
		display_name: "Arch Linux",
		default_arch: "x86_64",
		mirror_template: "https://geo.mirror.pkgbuild.com/$repo/os/$arch",
		keyring_packages: &["archlinux-keyring"],
		description: "Upstream x86_64 Arch Linux.",
	},
	DistroPreset {
		tag: "archlinuxarm",
		display_name: "Arch Linux ARM",
		default_arch: "aarch64",
		mirror_template: "http://mirror.archlinuxarm.org/$arch/$repo",
		keyring_packages: &["archlinuxarm-keyring"],
		description: "Arch Linux ARM, covering the aarch64 and armv7h ports.",
	},
	DistroPreset {
		tag: "archlinux32",
		display_name: "Arch Linux 32",
		default_arch: "i686",
		mirror_template: "https://de2.mirror.archlinux32.org/$arch/$repo",
		keyring_packages: &["archlinux32-keyring"],
		description: "Arch Linux 32, the i686 port.",
	},
	DistroPreset {
		tag: "archriscv",
		display_name: "Arch Linux RISC-V",
		default_arch: "riscv64",
		mirror_template: "https://riscv.mirror.pkgbuild.com/$repo/os/$arch",
		keyring_packages: &["archlinux-keyring"],
		description: "Arch Linux RISC-V, the riscv64 port.",
	},
	DistroPreset {
		tag: "archloong",
		display_name: "Arch Linux LoongArch",
		default_arch: "loong64",
		mirror_template: "https://loongarch.mirror.pkgbuild.com/$repo/os/$arch",
		keyring_packages: &["archlinux-keyring"],
		description: "Arch Linux LoongArch, the loong64 port.",
	},
];

/// Resolves a distro tag into a fresh [`BuildContext`] with every
/// distro-specific field filled in and every per-build field left at a
/// neutral default (the CLI layer applies board/flag overrides afterwards).
///
/// # Errors
/// Returns [`AimagerError::Configuration`] if the tag isn't in the table.
pub fn resolve(tag: &str) -> Result<BuildContext> {
	let preset = find(tag)
		.ok_or_else(|| AimagerError::configuration(format!("unknown --distro `{tag}`; try --distro help")))?;

	let mut repo_urls = BTreeMap::new();
	repo_urls.insert("core".to_owned(), preset.mirror_template.to_owned());

	let mut repo_keyring_pkgs = BTreeMap::new();
	repo_keyring_pkgs
		.insert("core".to_owned(), preset.keyring_packages.iter().map(|s| (*s).to_owned()).collect());

	Ok(BuildContext {
		host_arch: std::env::consts::ARCH.to_owned(),
		target_arch: preset.default_arch.to_owned(),
		distro: Distro::new(preset.tag, preset.display_name),
		board: String::new(),
		build_id: "default".to_owned(),
		extra_repos: Vec::new(),
		repo_urls,
		repo_keyring_pkgs,
		repo_core: "core".to_owned(),
		repos_base: None,
		initrd_maker: None,
		bootloaders: Vec::new(),
		kernels: Vec::new(),
		microcode: std::collections::BTreeSet::new(),
		user_packages: std::collections::BTreeSet::new(),
		locales: Vec::new(),
		hostname: None,
		kernel_appends: BTreeMap::new(),
		overlays: Vec::new(),
		reuse_root_archive: None,
		keyring_helper_archive: None,
		tmpfs_root_opts: None,
		out_prefix: std::path::PathBuf::from("out/"),
		work_dir: std::path::PathBuf::from("."),
		table: crate::partition::PartitionTable::default(),
		mkfs_args: BTreeMap::new(),
		create_targets: Vec::new(),
		run_mode: crate::context::RunMode::Build,
		binfmt_check: false,
		async_child: false,
		freeze_pacman_config: false,
		freeze_pacman_static: false,
		use_pacman_static: false,
		clean_builds: false,
	})
}

fn find(tag: &str) -> Option<&'static DistroPreset> {
	PRESETS.iter().find(|p| p.tag == tag)
}

/// Every known tag, for `--distro help`.
#[must_use]
pub fn tags() -> Vec<&'static str> {
	PRESETS.iter().map(|p| p.tag).collect()
}

/// One entry's human-readable description, for `--distro help=<tag>`.
#[must_use]
pub fn describe(tag: &str) -> Option<String> {
	find(tag).map(|p| {
		format!(
			"{} ({}): default arch {}, mirror template `{}`, keyring packages {:?}",
			p.tag, p.description, p.default_arch, p.mirror_template, p.keyring_packages
		)
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_known_distro() {
		let ctx = resolve("archlinux").unwrap();
		assert_eq!(ctx.target_arch, "x86_64");
		assert_eq!(ctx.distro.name, "Arch Linux");
		assert!(ctx.repo_urls.contains_key("core"));
	}

	#[test]
	fn rejects_unknown_distro() {
		assert!(resolve("not-a-distro").is_err());
	}

	#[test]
	fn tags_lists_every_preset() {
		assert!(tags().contains(&"archlinuxarm"));
	}

	#[test]
	fn describe_returns_none_for_unknown_tag() {
		assert!(describe("nope").is_none());
	}
}
