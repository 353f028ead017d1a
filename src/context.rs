//! `BuildContext`: the single frozen record everything downstream reads
//! from. Presets (`crate::presets`) are pure functions `BuildContext ->
//! Result<BuildContext>` that the CLI layer folds over before any I/O
//! happens, replacing the teacher's `board_*`/`distro_*` global-state
//! functions (§9 redesign flag).

use std::{
	collections::{BTreeMap, BTreeSet},
	path::PathBuf,
};

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::{error::AimagerError, partition::PartitionTable};

/// A target distribution: its CLI tag, its display name, and a filesystem/
/// cache-key-safe rendering of that name (§3 `distro (tag + stylised name +
/// safe name)`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distro {
	pub tag: String,
	pub name: String,
	pub safe_name: String,
}

impl Distro {
	#[must_use]
	pub fn new(tag: &str, name: &str) -> Self {
		let safe_name = name
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
			.collect();
		Self { tag: tag.to_owned(), name: name.to_owned(), safe_name }
	}
}

/// One of §6's run-target shortcuts (`--only-prepare-child`,
/// `--only-backup-keyring`) folded into the context instead of threaded as
/// three separate booleans (§3 `[SUPPLEMENT]`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunMode {
	#[default]
	Build,
	OnlyPrepareChild,
	OnlyBackupKeyring,
}

/// One of `--create`'s closed targets (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum CreateTarget {
	RootTar,
	PartBootImg,
	PartRootImg,
	PartHomeImg,
	DiskImg,
	KeyringHelperTar,
}

impl std::str::FromStr for CreateTarget {
	type Err = AimagerError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"root.tar" => Ok(Self::RootTar),
			"part-boot.img" => Ok(Self::PartBootImg),
			"part-root.img" => Ok(Self::PartRootImg),
			"part-home.img" => Ok(Self::PartHomeImg),
			"disk.img" => Ok(Self::DiskImg),
			"keyring-helper.tar" => Ok(Self::KeyringHelperTar),
			other => Err(AimagerError::configuration(format!("unknown --create target `{other}`"))),
		}
	}
}

impl CreateTarget {
	#[must_use]
	pub const fn file_name(self) -> &'static str {
		match self {
			Self::RootTar => "root.tar",
			Self::PartBootImg => "part-boot.img",
			Self::PartRootImg => "part-root.img",
			Self::PartHomeImg => "part-home.img",
			Self::DiskImg => "disk.img",
			Self::KeyringHelperTar => "keyring-helper.tar",
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InitrdMaker {
	Booster,
	Mkinitcpio,
	Dracut,
}

impl std::str::FromStr for InitrdMaker {
	type Err = AimagerError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"booster" => Ok(Self::Booster),
			"mkinitcpio" => Ok(Self::Mkinitcpio),
			"dracut" => Ok(Self::Dracut),
			other => Err(AimagerError::configuration(format!("unknown initrd maker `{other}`"))),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderKind {
	SystemdBoot,
	Syslinux,
	UbootExtlinux,
}

impl std::str::FromStr for BootloaderKind {
	type Err = AimagerError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"systemd-boot" => Ok(Self::SystemdBoot),
			"syslinux" => Ok(Self::Syslinux),
			"u-boot-extlinux" | "uboot" => Ok(Self::UbootExtlinux),
			other => Err(AimagerError::configuration(format!("unknown bootloader `{other}`"))),
		}
	}
}

/// The immutable-after-configuration record described in spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContext {
	pub host_arch: String,
	pub target_arch: String,
	pub distro: Distro,
	pub board: String,
	pub build_id: String,

	/// Extra (third-party) repo tags, in declared order.
	pub extra_repos: Vec<String>,
	/// repo tag -> mirror URL template (containing `$repo`/`$arch`).
	pub repo_urls: BTreeMap<String, String>,
	/// repo tag -> keyring package names that must be installed to trust it.
	pub repo_keyring_pkgs: BTreeMap<String, Vec<String>>,
	pub repo_core: String,
	/// Explicit base-repo order, if the caller supplied one (§4.3 step 2).
	pub repos_base: Option<Vec<String>>,

	pub initrd_maker: Option<InitrdMaker>,
	pub bootloaders: Vec<BootloaderKind>,
	pub kernels: Vec<String>,
	pub microcode: BTreeSet<String>,
	pub user_packages: BTreeSet<String>,
	pub locales: Vec<String>,
	pub hostname: Option<String>,
	/// `<kernel|all|default>` -> extra kernel command-line append (§6
	/// `--append-<kernel-or-all-or-default>`).
	pub kernel_appends: BTreeMap<String, String>,
	/// Overlay tarballs, applied over the chroot in this order (§4.8 step 8).
	pub overlays: Vec<PathBuf>,

	pub reuse_root_archive: Option<PathBuf>,
	pub keyring_helper_archive: Option<PathBuf>,
	pub tmpfs_root_opts: Option<String>,

	pub out_prefix: PathBuf,
	pub work_dir: PathBuf,

	pub table: PartitionTable,
	pub mkfs_args: BTreeMap<String, String>,

	pub create_targets: Vec<CreateTarget>,
	pub run_mode: RunMode,
	pub binfmt_check: bool,
	pub async_child: bool,
	pub freeze_pacman_config: bool,
	pub freeze_pacman_static: bool,
	pub use_pacman_static: bool,
	pub clean_builds: bool,
}

impl BuildContext {
	#[must_use]
	pub fn is_cross(&self) -> bool {
		self.host_arch != self.target_arch
	}

	/// `cache/build.<build-id>` scratch root (§3 `CacheLayout`).
	#[must_use]
	pub fn build_scratch(&self) -> PathBuf {
		self.work_dir.join("cache").join(format!("build.{}", self.build_id))
	}

	#[must_use]
	pub fn cache_root(&self) -> PathBuf {
		self.work_dir.join("cache")
	}

	/// Sanitized hostname candidate chain (§4.8 step 6): hostname | board |
	/// distro-safe-name | "aimager", with non-alphanumeric/non-hyphen
	/// characters stripped and lowercased.
	#[must_use]
	pub fn resolved_hostname(&self) -> String {
		let candidate = self
			.hostname
			.clone()
			.filter(|h| !h.is_empty())
			.or_else(|| (!self.board.is_empty()).then(|| self.board.clone()))
			.unwrap_or_else(|| self.distro.safe_name.clone());
		let sanitized: String =
			candidate.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect();
		let sanitized = sanitized.to_lowercase();
		if sanitized.is_empty() {
			"aimager".to_owned()
		} else {
			sanitized
		}
	}

	/// Default output prefix: `out/<distro>-<arch>-<board>-<ts>-`, matching
	/// the naming scheme scenario 1 of §8 expects (`<ts>` is supplied by the
	/// caller at configuration time, since the crate can't call
	/// `SystemTime::now()` from anywhere that needs to stay deterministic
	/// for tests).
	#[must_use]
	pub fn artifact_prefix(&self, timestamp: &str) -> PathBuf {
		let board = if self.board.is_empty() { "none".to_owned() } else { self.board.clone() };
		self.out_prefix.join(format!(
			"{}-{}-{board}-{timestamp}-",
			self.distro.safe_name, self.target_arch
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hostname_falls_back_through_chain() {
		let mut ctx = sample_ctx();
		ctx.hostname = None;
		ctx.board = String::new();
		assert_eq!(ctx.resolved_hostname(), "archlinux");
	}

	#[test]
	fn hostname_sanitizes_invalid_chars() {
		let mut ctx = sample_ctx();
		ctx.hostname = Some("My Host!.local".to_owned());
		assert_eq!(ctx.resolved_hostname(), "myhostlocal");
	}

	fn sample_ctx() -> BuildContext {
		BuildContext {
			host_arch: "x86_64".into(),
			target_arch: "x86_64".into(),
			distro: Distro::new("archlinux", "Arch Linux"),
			board: String::new(),
			build_id: "test".into(),
			extra_repos: vec![],
			repo_urls: BTreeMap::new(),
			repo_keyring_pkgs: BTreeMap::new(),
			repo_core: "core".into(),
			repos_base: None,
			initrd_maker: None,
			bootloaders: vec![],
			kernels: vec![],
			microcode: BTreeSet::new(),
			user_packages: BTreeSet::new(),
			locales: vec![],
			hostname: None,
			kernel_appends: BTreeMap::new(),
			overlays: vec![],
			reuse_root_archive: None,
			keyring_helper_archive: None,
			tmpfs_root_opts: None,
			out_prefix: PathBuf::from("out"),
			work_dir: PathBuf::from("."),
			table: PartitionTable::default(),
			mkfs_args: BTreeMap::new(),
			create_targets: vec![],
			run_mode: RunMode::Build,
			binfmt_check: false,
			async_child: false,
			freeze_pacman_config: false,
			freeze_pacman_static: false,
			use_pacman_static: false,
			clean_builds: false,
		}
	}
}
