//! Parent-side control flow (spec §2/§4.5): folds the parsed CLI into a
//! [`BuildContext`], resolves the caller's identity and subordinate id
//! range, serializes the context for the child to pick up, and spawns the
//! namespaced re-exec of this same binary.

use std::{path::Path, time::SystemTime};

use color_eyre::Result;

use crate::{
	cli::{Cli, HelpQuery},
	context::{BuildContext, RunMode},
	error::AimagerError,
	identity, namespace,
	presets::{board, distro},
};

/// Prints a preset/target help table to stdout and returns whether the
/// caller actually asked for one (so [`run`] can exit early without
/// treating "help printed" as an error).
fn print_help_if_requested(cli: &Cli) -> bool {
	let mut printed = false;

	if let Some(raw) = &cli.distro {
		match HelpQuery::parse(raw) {
			HelpQuery::All => {
				println!("known --distro tags:");
				for tag in distro::tags() {
					println!("  {tag}");
				}
				printed = true;
			},
			HelpQuery::One(tag) => {
				match distro::describe(&tag) {
					Some(desc) => println!("{desc}"),
					None => println!("unknown --distro tag `{tag}`"),
				}
				printed = true;
			},
			HelpQuery::None => {},
		}
	}

	if let Some(raw) = &cli.board {
		match HelpQuery::parse(raw) {
			HelpQuery::All => {
				println!("known --board tags:");
				for tag in board::tags() {
					println!("  {tag}");
				}
				printed = true;
			},
			HelpQuery::One(tag) => {
				match board::describe(&tag) {
					Some(desc) => println!("{desc}"),
					None => println!("unknown --board tag `{tag}`"),
				}
				printed = true;
			},
			HelpQuery::None => {},
		}
	}

	if let Some(raw) = &cli.table {
		match HelpQuery::parse(raw) {
			HelpQuery::All => {
				println!("known --table presets:");
				for tag in crate::partition::preset_tags() {
					println!("  {tag}");
				}
				printed = true;
			},
			HelpQuery::One(tag) => match crate::partition::preset(&tag) {
				Some(decl) => println!("{decl}"),
				None => println!("unknown --table preset `{tag}`"),
			},
			HelpQuery::None => {},
		}
	}

	if cli.create.iter().any(|c| c == "help") {
		println!("known --create targets:");
		for name in ["root.tar", "part-boot.img", "part-root.img", "part-home.img", "disk.img", "keyring-helper.tar"] {
			println!("  {name}");
		}
		printed = true;
	}

	printed
}

/// Resolves `--table`'s four accepted forms (§4.4/§6): raw declaration
/// text, `@<file>`, `=<preset>`, or left unset (caller keeps the preset's
/// or default table).
fn resolve_table(cli: &Cli, ctx: &mut BuildContext) -> Result<()> {
	let Some(raw) = &cli.table else { return Ok(()) };

	let declaration = if let Some(path) = raw.strip_prefix('@') {
		std::fs::read_to_string(path)?
	} else if let Some(tag) = raw.strip_prefix('=') {
		crate::partition::preset(tag)
			.ok_or_else(|| AimagerError::configuration(format!("unknown --table preset `{tag}`")))?
			.to_owned()
	} else {
		raw.clone()
	};

	ctx.table = crate::partition::PartitionTable::parse(&declaration, uuid::Uuid::new_v4)?;
	Ok(())
}

/// Builds the frozen [`BuildContext`] for this invocation: distro preset,
/// optional board preset, then every explicit CLI override (§2
/// "configuration" step).
///
/// # Errors
/// Returns an error if a preset tag, dynamic flag, or table declaration is
/// invalid.
fn build_context(cli: &Cli) -> Result<BuildContext> {
	let distro_tag = cli
		.distro
		.as_deref()
		.ok_or_else(|| AimagerError::configuration("--distro is required"))?;
	let mut ctx = distro::resolve(distro_tag)?;

	if let Some(board_tag) = &cli.board {
		ctx = board::apply(board_tag, ctx)?;
	}

	if let Some(host) = &cli.arch_host {
		ctx.host_arch = host.clone();
	}
	if let Some(target) = &cli.arch_target {
		ctx.target_arch = target.clone();
	}
	if let Some(build_id) = &cli.build_id {
		ctx.build_id = build_id.clone();
	}
	ctx.out_prefix = cli.out_prefix.clone();

	for repo in cli.add_repos() {
		if !ctx.extra_repos.contains(&repo) {
			ctx.extra_repos.push(repo);
		}
	}

	if let Some(parent) = &cli.repo_url_parent {
		for repo in std::iter::once(&ctx.repo_core).chain(ctx.extra_repos.iter()) {
			ctx.repo_urls.entry(repo.clone()).or_insert_with(|| parent.clone());
		}
	}
	for (tag, url) in cli.repo_urls()? {
		ctx.repo_urls.insert(tag, url);
	}

	if !cli.repo_core.is_empty() {
		ctx.repo_core = cli.repo_core.clone();
	}
	ctx.repos_base = cli.repos_base();
	ctx.reuse_root_archive = cli.reuse_root_tar.clone();
	ctx.initrd_maker = cli.initrd_maker()?;
	ctx.user_packages.extend(cli.install_packages());
	ctx.kernel_appends = cli.appends()?;
	ctx.locales = cli.locales();
	if let Some(hostname) = &cli.hostname {
		ctx.hostname = Some(hostname.clone());
	}
	ctx.overlays = cli.overlay.clone();
	ctx.mkfs_args = cli.mkfs_args()?;
	ctx.keyring_helper_archive = cli.keyring_helper.clone();
	ctx.tmpfs_root_opts = cli.tmpfs_root.clone();
	ctx.async_child = cli.async_child;
	ctx.freeze_pacman_config = cli.freeze_pacman_config;
	ctx.freeze_pacman_static = cli.freeze_pacman_static;
	ctx.use_pacman_static = cli.use_pacman_static;
	ctx.binfmt_check = cli.binfmt_check;
	ctx.clean_builds = cli.clean_builds;
	ctx.run_mode = cli.run_mode();

	resolve_table(cli, &mut ctx)?;

	let Some(targets) = cli.create_targets()? else {
		return Err(AimagerError::configuration("--create help was requested but reached context build").into());
	};
	ctx.create_targets = targets;

	ctx.work_dir = std::env::current_dir()?;

	Ok(ctx)
}

/// Runs the full parent-side flow for one invocation: builds the context,
/// resolves identity and id ranges, spawns the namespaced child, and waits
/// for it (§2, §4.5).
///
/// # Errors
/// Propagates configuration, identity, or namespace-spawn failures, or the
/// child's own exit status as a [`AimagerError::Subprocess`].
pub fn run(cli: &Cli, start_time: SystemTime) -> Result<()> {
	if print_help_if_requested(cli) {
		return Ok(());
	}

	let ctx = build_context(cli)?;

	if ctx.clean_builds {
		clean_build_scratches(&ctx.cache_root())?;
	}

	let caller = identity::current_caller()?;
	if matches!(ctx.run_mode, RunMode::OnlyPrepareChild) {
		tracing::info!("--only-prepare-child requested, stopping before namespace spawn");
		prepare_child_scratch(&ctx)?;
		return Ok(());
	}

	let uid_ranges = identity::lookup_subid_ranges(Path::new("/etc/subuid"), &caller.name, caller.uid.as_raw().into())?;
	let gid_ranges = identity::lookup_subid_ranges(Path::new("/etc/subgid"), &caller.name, caller.gid.as_raw().into())?;
	let uid_sub = identity::require_contiguous_range(&uid_ranges)?;
	let gid_sub = identity::require_contiguous_range(&gid_ranges)?;
	let uid_mappings = namespace::build_mappings(caller.uid.as_raw().into(), uid_sub);
	let gid_mappings = namespace::build_mappings(caller.gid.as_raw().into(), gid_sub);

	prepare_child_scratch(&ctx)?;

	namespace::install_cancellation_handlers()?;
	let self_exe = std::env::current_exe()?;
	let context_path = ctx.build_scratch().join("context.json");
	let child_args = vec!["--internal-child".to_owned(), "--context-path".to_owned(), context_path.display().to_string()];

	let (mut child, mut guard) = namespace::spawn(&self_exe, &child_args, uid_mappings, gid_mappings, ctx.async_child)?;
	let status = child.wait()?;
	guard.disarm();

	if !status.success() {
		return Err(AimagerError::subprocess("aimager --internal-child", status).into());
	}
	let _ = start_time;
	Ok(())
}

/// Writes the resolved context to its scratch location so the re-exec'd
/// child can read it back without repeating CLI parsing under the new
/// namespace (§4.5 "Spawning").
///
/// # Errors
/// Propagates filesystem or serialization failures.
fn prepare_child_scratch(ctx: &BuildContext) -> Result<()> {
	let scratch = ctx.build_scratch();
	std::fs::create_dir_all(&scratch)?;
	let json = serde_json::to_vec_pretty(ctx)?;
	crate::util::write_atomic(&scratch.join("context.json"), &json)?;
	Ok(())
}

/// Deletes every `cache/build.*` scratch directory (`--clean-builds`, §6).
fn clean_build_scratches(cache_root: &Path) -> Result<()> {
	let Ok(entries) = std::fs::read_dir(cache_root) else { return Ok(()) };
	for entry in entries.flatten() {
		let name = entry.file_name();
		if name.to_string_lossy().starts_with("build.") && entry.path().is_dir() {
			std::fs::remove_dir_all(entry.path())?;
		}
	}
	Ok(())
}

/// Reads back a context serialized by [`prepare_child_scratch`] (child-side
/// counterpart, invoked from `main.rs` when `--internal-child` is set).
///
/// # Errors
/// Propagates filesystem or deserialization failures.
pub fn load_context(context_path: &Path) -> Result<BuildContext> {
	let bytes = std::fs::read(context_path)?;
	Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[test]
	fn build_context_requires_distro() {
		let cli = Cli::parse_from(["aimager"]);
		assert!(build_context(&cli).is_err());
	}

	#[test]
	fn build_context_applies_board_after_distro() {
		let cli = Cli::parse_from([
			"aimager", "--distro", "archlinuxarm", "--board", "rpi4", "--create", "root.tar",
		]);
		let ctx = build_context(&cli).unwrap();
		assert_eq!(ctx.target_arch, "aarch64");
		assert!(ctx.bootloaders.contains(&crate::context::BootloaderKind::UbootExtlinux));
	}

	#[test]
	fn table_override_replaces_default() {
		let cli = Cli::parse_from([
			"aimager", "--distro", "archlinux", "--create", "root.tar", "--table", "=efi_generic",
		]);
		let ctx = build_context(&cli).unwrap();
		assert!(ctx.table.get(crate::partition::Role::Boot).is_some());
	}
}
