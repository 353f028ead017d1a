//! Package Manager Config Builder (spec §4.3): renders the loose/strict
//! `pacman.conf` pair that every chroot operation downstream binds against.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use serde::Serialize;
use tera::{Context, Tera};

use crate::{error::AimagerError, repo::expand_mirror, util::is_fresh};

const TEMPLATE: &str = include_str!("../templates/pacman.conf.tera");

#[derive(Debug, Clone, Serialize)]
pub struct RepoSection {
	pub name: String,
	pub server: Option<String>,
}

/// Everything the template needs, already resolved to concrete values (no
/// `BuildContext` borrow inside the renderer, so it stays independently
/// testable).
#[derive(Debug, Clone)]
pub struct PacmanConfigInputs {
	pub root_dir: PathBuf,
	pub db_path: PathBuf,
	pub cache_dir: PathBuf,
	pub log_file: PathBuf,
	pub gpg_dir: PathBuf,
	pub hook_dir: PathBuf,
	pub architecture: String,
	pub repos: Vec<RepoSection>,
}

impl PacmanConfigInputs {
	/// Binds every `[options]` path inside `chroot` (§4.3 step 4).
	#[must_use]
	pub fn for_chroot(chroot: &Path, architecture: &str, repos: Vec<RepoSection>) -> Self {
		Self {
			root_dir: chroot.to_path_buf(),
			db_path: chroot.join("var/lib/pacman"),
			cache_dir: chroot.join("var/cache/pacman/pkg"),
			log_file: chroot.join("var/log/pacman.log"),
			gpg_dir: chroot.join("etc/pacman.d/gnupg"),
			hook_dir: chroot.join("etc/pacman.d/hooks"),
			architecture: architecture.to_owned(),
			repos,
		}
	}
}

/// Parses `[<name>]` section headers from a fetched `pacman.conf`, in file
/// order, discarding `[options]` (§4.3 step 2).
#[must_use]
pub fn parse_base_repos(conf: &str) -> Vec<String> {
	conf.lines()
		.filter_map(|line| {
			let trimmed = line.trim();
			let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;
			(inner != "options").then(|| inner.to_owned())
		})
		.collect()
}

/// Validates a caller-supplied base repo order (§4.3 step 2): it must
/// contain the declared core repo and must not contain the reserved
/// `options` section name.
///
/// # Errors
/// Returns [`AimagerError::Configuration`] if either condition fails.
pub fn validate_base_repos(repos: &[String], core_repo: &str) -> Result<()> {
	if repos.iter().any(|r| r == "options") {
		return Err(AimagerError::configuration("--repos-base must not contain `options`").into());
	}
	if !repos.iter().any(|r| r == core_repo) {
		return Err(AimagerError::configuration(format!(
			"--repos-base must contain the core repo `{core_repo}`"
		))
		.into());
	}
	Ok(())
}

/// Renders one of the loose/strict variants.
///
/// # Errors
/// Returns an error if the embedded template fails to render (should only
/// happen if `inputs` somehow contains non-serializable data).
pub fn render(inputs: &PacmanConfigInputs, verify_signatures: bool) -> Result<String> {
	let mut context = Context::new();
	context.insert("root_dir", &inputs.root_dir);
	context.insert("db_path", &inputs.db_path);
	context.insert("cache_dir", &inputs.cache_dir);
	context.insert("log_file", &inputs.log_file);
	context.insert("gpg_dir", &inputs.gpg_dir);
	context.insert("hook_dir", &inputs.hook_dir);
	context.insert("architecture", &inputs.architecture);
	context.insert("verify_signatures", &verify_signatures);
	context.insert("repos", &inputs.repos);

	Tera::one_off(TEMPLATE, &context, false)
		.map_err(|e| AimagerError::parsing("pacman.conf template", e.to_string()).into())
}

/// Builds the per-repo template inputs for every extra third-party repo
/// declared in the context, expanding `$repo`/`$arch` in its mirror URL
/// (§4.3 step 5).
#[must_use]
pub fn extra_repo_sections(
	extra_repos: &[String], repo_urls: &std::collections::BTreeMap<String, String>, arch: &str,
) -> Vec<RepoSection> {
	extra_repos
		.iter()
		.map(|repo| {
			let server = repo_urls.get(repo).map(|tpl| expand_mirror(tpl, repo, arch));
			RepoSection { name: repo.clone(), server }
		})
		.collect()
}

/// Writes the loose/strict pair at `loose_path`/`strict_path`, honouring the
/// freeze policies from §4.3's last paragraph: if `freeze` is set and both
/// files exist, or both exist with mtime at or after `start_time`, the
/// regeneration is skipped.
///
/// # Errors
/// Propagates rendering or I/O failures.
pub fn write_config_pair(
	inputs: &PacmanConfigInputs, loose_path: &Path, strict_path: &Path, freeze: bool,
	start_time: std::time::SystemTime,
) -> Result<()> {
	let both_exist = loose_path.exists() && strict_path.exists();
	if both_exist && freeze {
		tracing::debug!("pacman config frozen by caller request, skipping regeneration");
		return Ok(());
	}
	if both_exist && is_fresh(loose_path, start_time) && is_fresh(strict_path, start_time) {
		tracing::debug!("pacman config already fresh for this run, skipping regeneration");
		return Ok(());
	}

	crate::util::write_atomic(loose_path, render(inputs, false)?.as_bytes())?;
	crate::util::write_atomic(strict_path, render(inputs, true)?.as_bytes())?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	#[test]
	fn parses_section_headers_preserving_order_and_dropping_options() {
		let conf = "[options]\nArchitecture = auto\n\n[core]\nInclude = x\n\n[extra]\nInclude = y\n";
		assert_eq!(parse_base_repos(conf), vec!["core".to_owned(), "extra".to_owned()]);
	}

	#[test]
	fn validates_core_repo_presence() {
		let repos = vec!["extra".to_owned()];
		assert!(validate_base_repos(&repos, "core").is_err());
	}

	#[test]
	fn rejects_reserved_options_token() {
		let repos = vec!["core".to_owned(), "options".to_owned()];
		assert!(validate_base_repos(&repos, "core").is_err());
	}

	#[test]
	fn accepts_order_containing_core() {
		let repos = vec!["extra".to_owned(), "core".to_owned()];
		assert!(validate_base_repos(&repos, "core").is_ok());
	}

	#[test]
	fn render_differs_only_in_siglevel() {
		let inputs = PacmanConfigInputs::for_chroot(Path::new("/chroot"), "x86_64", vec![]);
		let loose = render(&inputs, false).unwrap();
		let strict = render(&inputs, true).unwrap();
		assert!(loose.contains("SigLevel    = Never"));
		assert!(strict.contains("SigLevel    = Required DatabaseRequired"));
		assert!(loose.contains("RootDir     = /chroot"));
	}

	#[test]
	fn extra_repo_sections_expand_mirror_templates() {
		let mut urls = BTreeMap::new();
		urls.insert("archlinuxcn".to_owned(), "https://repo.archlinuxcn.org/$arch".to_owned());
		let sections = extra_repo_sections(&["archlinuxcn".to_owned()], &urls, "x86_64");
		assert_eq!(sections[0].server.as_deref(), Some("https://repo.archlinuxcn.org/x86_64"));
	}
}
