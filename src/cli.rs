//! Command-line surface (spec §6). Argument parsing and help text are
//! explicitly out of scope for the core's *behavior* (§1), but the shapes
//! here are the glue that folds a parsed invocation into a frozen
//! [`crate::context::BuildContext`] (§2's "caller process performs
//! configuration" step), matching the teacher's `KatsuCli` struct feeding
//! `KatsuBuilder::new` in `main.rs`.
//!
//! A handful of flags in §6 are spelled with the target embedded in the
//! flag name itself (`--repo-url-<tag>`, `--append-<kernel-or-all>`).
//! `clap`'s derive API has no runtime-named flags, so those are modeled as
//! repeatable `KEY=VALUE` pairs instead (`--repo-url <tag>=<url>`,
//! `--append <target>=<cmdline>`); the resolved semantics (an arbitrary
//! repo tag or kernel-or-all-or-default name mapping to a string) are
//! unchanged, only the spelling of the flag.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;

use crate::{
	context::{CreateTarget, InitrdMaker, RunMode},
	error::AimagerError,
};

/// Splits a caller-supplied comma-separated list, trimming empty entries.
fn split_csv(raw: &str) -> Vec<String> {
	raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(ToOwned::to_owned).collect()
}

/// Splits a `KEY=VALUE` pair used by the flattened dynamic-flag options.
fn split_kv(raw: &str) -> Result<(String, String)> {
	raw.split_once('=')
		.map(|(k, v)| (k.to_owned(), v.to_owned()))
		.ok_or_else(|| AimagerError::configuration(format!("expected `KEY=VALUE`, got `{raw}`")).into())
}

#[derive(Parser, Debug)]
#[command(author, version, about = "A rootless, cross-architecture builder for Arch Linux images")]
pub struct Cli {
	/// Host architecture; defaults to the running kernel's `uname -m`.
	#[arg(long = "arch-host")]
	pub arch_host: Option<String>,

	/// Target architecture to build for.
	#[arg(long = "arch-target", visible_alias = "arch")]
	pub arch_target: Option<String>,

	/// Board preset tag, or `help`/`help=<tag>` to describe the table.
	#[arg(long)]
	pub board: Option<String>,

	/// Distro preset tag, or `help`/`help=<tag>` to describe the table.
	#[arg(long)]
	pub distro: Option<String>,

	/// Stable identifier for this build run.
	#[arg(long = "build-id")]
	pub build_id: Option<String>,

	/// Prefix directory/filename stem for emitted artifacts.
	#[arg(long = "out-prefix", default_value = "out/")]
	pub out_prefix: PathBuf,

	/// Extra third-party repo tag (repeatable).
	#[arg(long = "add-repo")]
	pub add_repo: Vec<String>,

	/// Extra third-party repo tags, comma-separated.
	#[arg(long = "add-repos")]
	pub add_repos: Option<String>,

	/// Name of the distro's own first-party "core" repo.
	#[arg(long = "repo-core", default_value = "core")]
	pub repo_core: String,

	/// Mirror URL template shared by every repo that doesn't override it.
	#[arg(long = "repo-url-parent")]
	pub repo_url_parent: Option<String>,

	/// Per-repo mirror URL override, `<tag>=<template>` (repeatable).
	/// Flattens the spec's `--repo-url-<tag>` dynamic flag.
	#[arg(long = "repo-url", value_name = "TAG=URL")]
	pub repo_url: Vec<String>,

	/// Explicit base-repo order, comma-separated.
	#[arg(long = "repos-base")]
	pub repos_base: Option<String>,

	/// Reuse a previously built root tarball instead of bootstrapping.
	#[arg(long = "reuse-root-tar")]
	pub reuse_root_tar: Option<PathBuf>,

	/// Initrd generator to pin to a single universal image.
	#[arg(long = "initrd-maker")]
	pub initrd_maker: Option<String>,

	/// Extra package to install (repeatable).
	#[arg(long = "install-pkg")]
	pub install_pkg: Vec<String>,

	/// Extra packages to install, comma-separated.
	#[arg(long = "install-pkgs")]
	pub install_pkgs: Option<String>,

	/// Kernel command-line append, `<kernel|all|default>=<cmdline>`
	/// (repeatable). Flattens the spec's `--append-<kernel-or-all-or-default>`
	/// dynamic flag.
	#[arg(long = "append", value_name = "TARGET=CMDLINE")]
	pub append: Vec<String>,

	/// Locale to enable (repeatable).
	#[arg(long)]
	pub locale: Vec<String>,

	/// Locales to enable, comma-separated.
	#[arg(long)]
	pub locales: Option<String>,

	/// Target hostname.
	#[arg(long)]
	pub hostname: Option<String>,

	/// Overlay tarball to extract over the chroot, in order (repeatable).
	#[arg(long)]
	pub overlay: Vec<PathBuf>,

	/// Partition table: raw `sfdisk --dump` text, `@<file>`, `=<preset>`,
	/// `help`, or `help=<preset>`.
	#[arg(long)]
	pub table: Option<String>,

	/// Extra `mkfs` argument for one partition role, `<role>=<arg>`
	/// (repeatable).
	#[arg(long = "mkfs-arg", value_name = "ROLE=ARG")]
	pub mkfs_arg: Vec<String>,

	/// Use the asynchronous (`newuidmap`/`newgidmap`) id-mapping path
	/// instead of the synchronous `unshare --map-users` path.
	#[arg(long = "async-child")]
	pub async_child: bool,

	/// Skip regenerating `pacman.conf` pair if both files already exist.
	#[arg(long = "freeze-pacman-config")]
	pub freeze_pacman_config: bool,

	/// Skip re-fetching the static host package manager if already cached.
	#[arg(long = "freeze-pacman-static")]
	pub freeze_pacman_static: bool,

	/// Bind-mounted tree of native-arch keyring-management binaries.
	#[arg(long = "keyring-helper")]
	pub keyring_helper: Option<PathBuf>,

	/// Mount a tmpfs at the chroot root, optionally with mount options.
	#[arg(long = "tmpfs-root", value_name = "OPTS", num_args = 0..=1, default_missing_value = "")]
	pub tmpfs_root: Option<String>,

	/// Use a statically linked host package manager instead of the host's
	/// own, even if the host already has one for this format.
	#[arg(long = "use-pacman-static")]
	pub use_pacman_static: bool,

	/// Run the cross-arch smoke test even on a non-cross build.
	#[arg(long = "binfmt-check")]
	pub binfmt_check: bool,

	/// Delete every `cache/build.*` scratch directory before building.
	#[arg(long = "clean-builds")]
	pub clean_builds: bool,

	/// Artifact to produce (repeatable): `root.tar`, `part-boot.img`,
	/// `part-root.img`, `part-home.img`, `disk.img`, `keyring-helper.tar`,
	/// or `help`.
	#[arg(long)]
	pub create: Vec<String>,

	/// Run only through child-side preparation, then stop.
	#[arg(long = "only-prepare-child")]
	pub only_prepare_child: bool,

	/// Run only the keyring backup step, then stop.
	#[arg(long = "only-backup-keyring")]
	pub only_backup_keyring: bool,

	/// Internal: re-exec entry point used as the namespaced child. Not
	/// part of the documented surface; set by the parent when it spawns
	/// itself under `unshare`.
	#[arg(long = "internal-child", hide = true)]
	pub internal_child: bool,

	/// Internal: path to the serialized [`crate::context::BuildContext`]
	/// the parent wrote before spawning this child.
	#[arg(long = "context-path", hide = true)]
	pub context_path: Option<PathBuf>,
}

impl Cli {
	#[must_use]
	pub fn add_repos(&self) -> Vec<String> {
		let mut repos = self.add_repo.clone();
		if let Some(csv) = &self.add_repos {
			repos.extend(split_csv(csv));
		}
		repos
	}

	#[must_use]
	pub fn install_packages(&self) -> Vec<String> {
		let mut pkgs = self.install_pkg.clone();
		if let Some(csv) = &self.install_pkgs {
			pkgs.extend(split_csv(csv));
		}
		pkgs
	}

	#[must_use]
	pub fn locales(&self) -> Vec<String> {
		let mut locales = self.locale.clone();
		if let Some(csv) = &self.locales {
			locales.extend(split_csv(csv));
		}
		locales
	}

	#[must_use]
	pub fn repos_base(&self) -> Option<Vec<String>> {
		self.repos_base.as_deref().map(split_csv)
	}

	/// Resolves the `--repo-url <tag>=<url>` pairs into a map.
	///
	/// # Errors
	/// Returns an error if any entry isn't `KEY=VALUE`.
	pub fn repo_urls(&self) -> Result<std::collections::BTreeMap<String, String>> {
		self.repo_url.iter().map(|raw| split_kv(raw)).collect()
	}

	/// Resolves the `--append <target>=<cmdline>` pairs into a map.
	///
	/// # Errors
	/// Returns an error if any entry isn't `KEY=VALUE`.
	pub fn appends(&self) -> Result<std::collections::BTreeMap<String, String>> {
		self.append.iter().map(|raw| split_kv(raw)).collect()
	}

	/// Resolves the `--mkfs-arg <role>=<arg>` pairs into a map.
	///
	/// # Errors
	/// Returns an error if any entry isn't `KEY=VALUE`.
	pub fn mkfs_args(&self) -> Result<std::collections::BTreeMap<String, String>> {
		self.mkfs_arg.iter().map(|raw| split_kv(raw)).collect()
	}

	/// Parses `--create` into the closed target set, expanding a bare
	/// `help` into `None` (caller prints the target table and exits).
	///
	/// # Errors
	/// Returns an error if any entry isn't a known target or `help`.
	pub fn create_targets(&self) -> Result<Option<Vec<CreateTarget>>> {
		if self.create.iter().any(|c| c == "help") {
			return Ok(None);
		}
		self.create.iter().map(|c| c.parse()).collect::<Result<Vec<_>, AimagerError>>().map(Some).map_err(Into::into)
	}

	#[must_use]
	pub fn run_mode(&self) -> RunMode {
		if self.only_prepare_child {
			RunMode::OnlyPrepareChild
		} else if self.only_backup_keyring {
			RunMode::OnlyBackupKeyring
		} else {
			RunMode::Build
		}
	}

	/// Parses `--initrd-maker`, if given.
	///
	/// # Errors
	/// Returns an error if the tag is unrecognized.
	pub fn initrd_maker(&self) -> Result<Option<InitrdMaker>> {
		self.initrd_maker.as_deref().map(str::parse).transpose().map_err(Into::into)
	}
}

/// `help`/`help=<tag>` convention shared by `--board`, `--distro`, and
/// `--table` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelpQuery {
	/// Not a help invocation; resolve the tag normally.
	None,
	/// List every entry in the table.
	All,
	/// Describe a single entry.
	One(String),
}

impl HelpQuery {
	#[must_use]
	pub fn parse(raw: &str) -> Self {
		if raw == "help" {
			Self::All
		} else if let Some(tag) = raw.strip_prefix("help=") {
			Self::One(tag.to_owned())
		} else {
			Self::None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_csv_trims_and_drops_empties() {
		assert_eq!(split_csv(" a, b ,,c"), vec!["a", "b", "c"]);
	}

	#[test]
	fn split_kv_requires_equals() {
		assert!(split_kv("no-equals-here").is_err());
		let (k, v) = split_kv("core=https://example/$repo").unwrap();
		assert_eq!(k, "core");
		assert_eq!(v, "https://example/$repo");
	}

	#[test]
	fn help_query_recognizes_bare_and_tagged_forms() {
		assert_eq!(HelpQuery::parse("help"), HelpQuery::All);
		assert_eq!(HelpQuery::parse("help=rpi4"), HelpQuery::One("rpi4".to_owned()));
		assert_eq!(HelpQuery::parse("rpi4"), HelpQuery::None);
	}

	#[test]
	fn cli_parses_repeatable_and_csv_forms_together() {
		let cli = Cli::parse_from([
			"aimager",
			"--install-pkg",
			"vim",
			"--install-pkgs",
			"git,htop",
			"--create",
			"root.tar",
		]);
		assert_eq!(cli.install_packages(), vec!["vim", "git", "htop"]);
	}
}
