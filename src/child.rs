//! Child-side orchestration (spec §2 "the child builds the chroot,
//! installs packages, runs setup, emits artifacts, then tears down
//! mounts"): runs entirely inside the namespaced child process, strictly
//! sequentially (§5 "The child is strictly sequential").

use std::{path::Path, time::SystemTime};

use color_eyre::Result;

use crate::{
	cache::CacheLayout,
	context::{BuildContext, RunMode},
	emit::{self, ArtifactRegistry},
	error::AimagerError,
	host_pm, keyring,
	pacman_config::{self, PacmanConfigInputs},
	setup::{self, bootloader, initrd},
};

/// `pacman-key --init`/`--populate` argument pair for a distro tag. Not
/// itself a spec component: the distro preset table doesn't carry this
/// today, so it's derived here from the tag, matching the upstream
/// keyring package naming convention (`<tag>-keyring`).
fn keyring_init_populate_cmds(distro_tag: &str) -> ([&'static str; 2], (&'static str, String)) {
	(["pacman-key", "--init"], ("pacman-key", distro_tag.to_owned()))
}

/// Runs the full child-side build (§4.6 through §4.9), honoring
/// [`RunMode::OnlyBackupKeyring`] as an early stop after the keyring
/// backup is written.
///
/// # Errors
/// Propagates the first failure from any stage; nothing past that stage
/// runs (§7 "all errors are fatal to the current run").
pub fn run(ctx: &BuildContext, start_time: SystemTime) -> Result<()> {
	crate::namespace::child_wait_for_mapping()?;

	let chroot = ctx.build_scratch().join("root");
	crate::childroot::build(&chroot, ctx.tmpfs_root_opts.as_deref())?;

	let cache = CacheLayout::new(&ctx.work_dir);
	let pacman_bin = host_pm::resolve(
		&cache,
		&ctx.distro.tag,
		&ctx.host_arch,
		ctx.use_pacman_static,
		ctx.freeze_pacman_static,
		start_time,
	)?;

	bootstrap(ctx, &cache, &chroot, &pacman_bin, start_time)?;
	if matches!(ctx.run_mode, RunMode::OnlyBackupKeyring) {
		tracing::info!("--only-backup-keyring requested, stopping after keyring bootstrap");
		return Ok(());
	}

	run_setup(ctx, &chroot, &pacman_bin, start_time)?;

	let mut registry = ArtifactRegistry::new();
	let out_prefix = ctx.artifact_prefix(&ctx.build_id);
	emit::emit_all(&mut registry, &ctx.create_targets, &chroot, &ctx.table, &out_prefix, &ctx.mkfs_args)?;

	Ok(())
}

/// §4.7: reuse a prebuilt root, or drive a fresh bootstrap + keyring init.
fn bootstrap(
	ctx: &BuildContext, cache: &CacheLayout, chroot: &Path, pacman_bin: &Path, start_time: SystemTime,
) -> Result<()> {
	if let Some(archive) = &ctx.reuse_root_archive {
		keyring::reuse_root_archive(archive, chroot, ctx.is_cross() || ctx.binfmt_check)?;
		return Ok(());
	}

	let loose_path = ctx.build_scratch().join("etc/pacman-loose.conf");
	let strict_path = ctx.build_scratch().join("etc/pacman-strict.conf");
	let repos = base_repo_sections(ctx, cache, start_time)?;
	let inputs = PacmanConfigInputs::for_chroot(chroot, &ctx.target_arch, repos);
	pacman_config::write_config_pair(
		&inputs,
		&loose_path,
		&strict_path,
		ctx.freeze_pacman_config,
		start_time,
	)?;

	let mut bootstrap_pkgs = vec!["base".to_owned()];
	for pkgs in ctx.repo_keyring_pkgs.values() {
		bootstrap_pkgs.extend(pkgs.iter().cloned());
	}
	keyring::install_base_and_keyrings(pacman_bin, &loose_path, &bootstrap_pkgs)?;
	if ctx.is_cross() || ctx.binfmt_check {
		keyring::smoke_test(chroot)?;
	}

	let keyring_id = keyring::compute_keyring_id(chroot)?;
	let restored = keyring::restore_cached_keyring(cache, &keyring_id, chroot)?;
	if !restored {
		let (init_cmd, (populate_bin, populate_arg)) = keyring_init_populate_cmds(&ctx.distro.tag);
		let populate_cmd: [&str; 3] = [populate_bin, "--populate", populate_arg.as_str()];
		if let Some(helper) = &ctx.keyring_helper_archive {
			keyring::init_keyring_with_helper(chroot, helper, &init_cmd, &populate_cmd)?;
		} else {
			keyring::init_keyring_in_chroot(chroot, &init_cmd, &populate_cmd)?;
		}
		keyring::backup_keyring(cache, &keyring_id, chroot)?;
	}

	keyring::verify_with_strict_redownload(pacman_bin, &strict_path, &bootstrap_pkgs)?;
	Ok(())
}

/// Resolves the base-repo section list for the `pacman.conf` pair (§4.3
/// step 1-2): fetch the target distro's own `pacman.conf`, then either
/// trust the caller's `--repos-base` or parse it out.
fn base_repo_sections(
	ctx: &BuildContext, cache: &CacheLayout, start_time: SystemTime,
) -> Result<Vec<pacman_config::RepoSection>> {
	use crate::repo::RepoClient;

	let client = RepoClient::new(cache, &ctx.distro.tag);
	let Some(core_mirror) = ctx.repo_urls.get(&ctx.repo_core) else {
		return Err(AimagerError::configuration(format!(
			"no mirror URL configured for core repo `{}`",
			ctx.repo_core
		))
		.into());
	};

	let db_path = client.fetch_db(core_mirror, &ctx.repo_core, &ctx.target_arch, start_time)?;
	let db = crate::repo::RepoClient::load_db(&db_path)?;
	let (record, local_path) =
		client.resolve_package(&db, core_mirror, &ctx.repo_core, &ctx.target_arch, "pacman")?;
	let conf_path = client.extract_path(&ctx.repo_core, &ctx.target_arch, &record, &local_path, "etc/pacman.conf")?;
	let conf_text = std::fs::read_to_string(&conf_path)?;

	let base_repos = match &ctx.repos_base {
		Some(repos) => {
			pacman_config::validate_base_repos(repos, &ctx.repo_core)?;
			repos.clone()
		},
		None => pacman_config::parse_base_repos(&conf_text),
	};

	let mut sections: Vec<pacman_config::RepoSection> = base_repos
		.into_iter()
		.map(|name| pacman_config::RepoSection {
			server: ctx.repo_urls.get(&name).map(|tpl| crate::repo::expand_mirror(tpl, &name, &ctx.target_arch)),
			name,
		})
		.collect();
	sections.extend(pacman_config::extra_repo_sections(&ctx.extra_repos, &ctx.repo_urls, &ctx.target_arch));
	Ok(sections)
}

/// §4.8: initrd pinning, package installation, fstab, bootloader,
/// hostname, locale, overlays.
fn run_setup(ctx: &BuildContext, chroot: &Path, pacman_bin: &Path, start_time: SystemTime) -> Result<()> {
	let strict_path = ctx.build_scratch().join("etc/pacman-strict.conf");

	let mut install_pkgs: Vec<String> = Vec::new();
	if let Some(maker) = ctx.initrd_maker {
		if !provides_initramfs(chroot) {
			install_pkgs.push(initrd_package_name(maker));
			setup::install_packages(pacman_bin, &strict_path, &install_pkgs)?;
			initrd::force_universal(chroot, maker)?;
			install_pkgs.clear();
		}
	}

	install_pkgs.extend(ctx.kernels.iter().cloned());
	install_pkgs.extend(ctx.microcode.iter().cloned());
	install_pkgs.extend(ctx.user_packages.iter().cloned());
	for bl in &ctx.bootloaders {
		install_pkgs.push(bootloader_package_name(*bl).to_owned());
	}
	setup::install_packages(pacman_bin, &strict_path, &install_pkgs)?;

	if matches!(ctx.initrd_maker, Some(crate::context::InitrdMaker::Mkinitcpio)) {
		initrd::restore_per_kernel_presets(chroot, &ctx.kernels)?;
	}

	let extra_sections = pacman_config::extra_repo_sections(&ctx.extra_repos, &ctx.repo_urls, &ctx.target_arch);
	setup::append_extra_repos(chroot, &extra_sections)?;

	let fstab = setup::fstab::render(&ctx.table)?;
	std::fs::write(chroot.join("etc/fstab"), fstab)?;

	for bl in &ctx.bootloaders {
		let kernels = kernel_entries(ctx);
		let cmdline = ctx
			.kernel_appends
			.get("all")
			.or_else(|| ctx.kernel_appends.get("default"))
			.cloned()
			.unwrap_or_default();
		let inputs = bootloader::BootloaderInputs {
			chroot,
			target_arch: &ctx.target_arch,
			table: &ctx.table,
			kernels: &kernels,
			kernel_cmdline: &cmdline,
		};
		bootloader::install(*bl, &inputs)?;
	}

	setup::write_hostname(chroot, &ctx.resolved_hostname())?;
	setup::configure_locales(chroot, &ctx.locales)?;
	setup::apply_overlays(chroot, &ctx.overlays)?;
	let _ = start_time;
	Ok(())
}

fn kernel_entries(ctx: &BuildContext) -> Vec<bootloader::KernelEntry> {
	let microcodes: Vec<String> = ctx.microcode.iter().map(|m| format!("{m}.img")).collect();
	ctx.kernels
		.iter()
		.map(|kernel| {
			let mut initrds = microcodes.clone();
			initrds.push(format!("initramfs-{kernel}.img"));
			bootloader::KernelEntry {
				name: kernel.clone(),
				vmlinuz: format!("vmlinuz-{kernel}"),
				initrds,
				fdtdir: None,
				fdt: None,
			}
		})
		.collect()
}

fn provides_initramfs(chroot: &Path) -> bool {
	chroot.join("usr/lib/initcpio").is_dir() || chroot.join("usr/lib/booster").is_dir()
}

fn initrd_package_name(maker: crate::context::InitrdMaker) -> String {
	match maker {
		crate::context::InitrdMaker::Booster => "booster".to_owned(),
		crate::context::InitrdMaker::Mkinitcpio => "mkinitcpio".to_owned(),
		crate::context::InitrdMaker::Dracut => "dracut".to_owned(),
	}
}

fn bootloader_package_name(kind: crate::context::BootloaderKind) -> &'static str {
	match kind {
		crate::context::BootloaderKind::SystemdBoot => "systemd",
		crate::context::BootloaderKind::Syslinux => "syslinux",
		crate::context::BootloaderKind::UbootExtlinux => "uboot-tools",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn initrd_package_names_match_upstream() {
		assert_eq!(initrd_package_name(crate::context::InitrdMaker::Booster), "booster");
		assert_eq!(initrd_package_name(crate::context::InitrdMaker::Mkinitcpio), "mkinitcpio");
	}

	#[test]
	fn kernel_entries_put_microcode_before_kernel_initrd() {
		let mut ctx_microcode = std::collections::BTreeSet::new();
		ctx_microcode.insert("intel-ucode".to_owned());
		let ctx = test_ctx(ctx_microcode);
		let entries = kernel_entries(&ctx);
		assert_eq!(entries[0].initrds, vec!["intel-ucode.img", "initramfs-linux.img"]);
	}

	fn test_ctx(microcode: std::collections::BTreeSet<String>) -> BuildContext {
		let mut ctx = crate::presets::distro::resolve("archlinux").unwrap();
		ctx.kernels = vec!["linux".to_owned()];
		ctx.microcode = microcode;
		ctx
	}
}
