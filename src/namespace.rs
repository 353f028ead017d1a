//! Identity & Namespace Orchestrator (spec §4.5): the sync/async fork dance
//! around the external `unshare` helper, uid/gid mapping, and the
//! cancellation and mapping handshake that keep the child from ever running
//! as real root.

use std::{
	path::Path,
	process::{Child, Command, Stdio},
	sync::atomic::{AtomicI32, Ordering},
	time::Duration,
};

use color_eyre::Result;
use nix::{
	sys::signal::{self, SigHandler, Signal},
	unistd::Pid,
};

use crate::{error::AimagerError, identity::SubRange};

/// One of the two `unshare --map-users`/`--map-groups` argument grammars
/// known to exist in the wild (§4.5 sync mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperSyntax {
	/// `inner:outer:count`
	InnerOuterCount,
	/// `outer,inner,count`
	OuterInnerCount,
}

impl HelperSyntax {
	/// Picks a syntax by sniffing `unshare --help` output: releases that
	/// document the comma-joined triple support the newer grammar, anything
	/// else falls back to the historical colon form.
	#[must_use]
	pub fn detect(help_text: &str) -> Self {
		if help_text.contains("outer,inner,count") || help_text.contains("<outer>,<inner>,<count>") {
			Self::OuterInnerCount
		} else {
			Self::InnerOuterCount
		}
	}

	#[must_use]
	pub fn format(self, mapping: IdMapping) -> String {
		match self {
			Self::InnerOuterCount => {
				format!("{}:{}:{}", mapping.inner_start, mapping.outer_start, mapping.count)
			},
			Self::OuterInnerCount => {
				format!("{},{},{}", mapping.outer_start, mapping.inner_start, mapping.count)
			},
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
	pub inner_start: u64,
	pub outer_start: u64,
	pub count: u64,
}

/// Builds the two required mappings (§4.5 "Spawning"): inner id 0 maps to
/// the caller's own id, and the rest of the inner range maps onto the
/// allocated subordinate range.
#[must_use]
pub fn build_mappings(caller_id: u64, sub: SubRange) -> [IdMapping; 2] {
	[
		IdMapping { inner_start: 0, outer_start: caller_id, count: 1 },
		IdMapping { inner_start: 1, outer_start: sub.start, count: sub.count },
	]
}

/// Probes `unshare --help` to learn which mapping-argument grammar is
/// supported, for sync-mode spawning.
///
/// # Errors
/// Returns an error if the helper binary can't be located or run.
pub fn probe_helper() -> Result<HelperSyntax> {
	let out = Command::new("unshare").arg("--help").output()?;
	let text = format!(
		"{}{}",
		String::from_utf8_lossy(&out.stdout),
		String::from_utf8_lossy(&out.stderr)
	);
	Ok(HelperSyntax::detect(&text))
}

/// Builds the `unshare` invocation that maps ids itself (§4.5 sync mode).
#[must_use]
pub fn sync_command(
	syntax: HelperSyntax, uid_mappings: &[IdMapping; 2], gid_mappings: &[IdMapping; 2],
	self_exe: &Path, child_args: &[String],
) -> Command {
	let mut cmd = Command::new("unshare");
	cmd.args(["--user", "--pid", "--mount", "--fork"]);
	for mapping in uid_mappings {
		cmd.arg(format!("--map-users={}", syntax.format(*mapping)));
	}
	for mapping in gid_mappings {
		cmd.arg(format!("--map-groups={}", syntax.format(*mapping)));
	}
	cmd.arg(self_exe).args(child_args);
	cmd
}

/// Builds the `unshare` invocation for async mode: no mapping options, the
/// orchestrator maps ids externally once the child is running (§4.5 async
/// mode).
#[must_use]
pub fn async_command(self_exe: &Path, child_args: &[String]) -> Command {
	let mut cmd = Command::new("unshare");
	cmd.args(["--user", "--pid", "--mount", "--fork"]).arg(self_exe).args(child_args);
	cmd
}

/// How long the orchestrator sleeps after spawning in async mode before
/// attempting the external `newuidmap`/`newgidmap` calls, giving the child
/// time to reach its mapping wait point.
const ASYNC_MAP_DELAY: Duration = Duration::from_millis(200);

/// Runs `newuidmap`/`newgidmap` against `pid` with the given mappings
/// (§4.5 async mode).
///
/// # Errors
/// Returns an error if either helper exits non-zero.
pub fn apply_external_maps(
	pid: Pid, uid_mappings: &[IdMapping; 2], gid_mappings: &[IdMapping; 2],
) -> Result<()> {
	run_idmap_helper("newuidmap", pid, uid_mappings)?;
	run_idmap_helper("newgidmap", pid, gid_mappings)?;
	Ok(())
}

fn run_idmap_helper(helper: &str, pid: Pid, mappings: &[IdMapping; 2]) -> Result<()> {
	let mut cmd = Command::new(helper);
	cmd.arg(pid.as_raw().to_string());
	for mapping in mappings {
		cmd.args([
			mapping.inner_start.to_string(),
			mapping.outer_start.to_string(),
			mapping.count.to_string(),
		]);
	}
	crate::util::run(&mut cmd)
}

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn kill_tracked_child(_signal: i32) {
	let pid = CHILD_PID.load(Ordering::SeqCst);
	if pid > 0 {
		let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
	}
	std::process::exit(1);
}

/// Installs handlers that forward SIGINT/SIGTERM as SIGKILL to the tracked
/// child (§4.5 "Cancellation"). Must be called once, before [`track_child`].
///
/// # Safety
/// Registers a signal handler; the handler itself only touches an atomic and
/// calls the async-signal-safe `kill(2)`, so this is sound to call from a
/// single-threaded orchestrator at startup.
pub fn install_cancellation_handlers() -> Result<()> {
	let handler = SigHandler::Handler(kill_tracked_child);
	unsafe {
		signal::signal(Signal::SIGINT, handler)
			.map_err(|e| AimagerError::namespace(format!("sigaction(SIGINT) failed: {e}")))?;
		signal::signal(Signal::SIGTERM, handler)
			.map_err(|e| AimagerError::namespace(format!("sigaction(SIGTERM) failed: {e}")))?;
	}
	Ok(())
}

/// Registers `child` as the process to SIGKILL on cancellation, and returns
/// a guard that un-registers it and sends SIGKILL itself if dropped while
/// still armed (covers the `EXIT` trap half of §4.5 "Cancellation").
pub fn track_child(child: &Child) -> ChildGuard {
	CHILD_PID.store(i32::try_from(child.id()).unwrap_or(0), Ordering::SeqCst);
	ChildGuard { pid: Pid::from_raw(i32::try_from(child.id()).unwrap_or(0)), armed: true }
}

pub struct ChildGuard {
	pid: Pid,
	armed: bool,
}

impl ChildGuard {
	/// Disarms the guard once the child has been `wait()`-ed on normally.
	pub fn disarm(&mut self) {
		self.armed = false;
		CHILD_PID.store(0, Ordering::SeqCst);
	}
}

impl Drop for ChildGuard {
	fn drop(&mut self) {
		if self.armed {
			let _ = signal::kill(self.pid, Signal::SIGKILL);
			CHILD_PID.store(0, Ordering::SeqCst);
		}
	}
}

/// Child-side half of the mapping handshake (§4.5 "Child wait-for-map
/// handshake"): polls `/sys/sys_write_test` once a second for up to ten
/// seconds, expecting every attempt to fail. A successful write means the
/// mapping never took effect and we are still real root.
///
/// # Errors
/// Returns [`AimagerError::Namespace`] if the write succeeds (real root) or
/// if ten seconds pass without failure confirmation.
pub fn child_wait_for_mapping() -> Result<()> {
	const PROBE_PATH: &str = "/sys/sys_write_test";
	const MAX_ATTEMPTS: u32 = 10;

	for attempt in 0..MAX_ATTEMPTS {
		match std::fs::write(PROBE_PATH, b"x") {
			Ok(()) => {
				return Err(AimagerError::namespace(
					"write to /sys/sys_write_test succeeded: process is still real root",
				)
				.into());
			},
			Err(_) => {
				tracing::trace!(attempt, "mapping not yet confirmed");
				std::thread::sleep(Duration::from_secs(1));
			},
		}
	}
	Err(AimagerError::namespace("timed out waiting for uid/gid mapping to take effect").into())
}

/// Spawns the namespaced child, selecting sync or async mode, and returns
/// the spawned [`Child`] plus a cancellation guard already armed on it.
///
/// # Errors
/// Propagates spawn failures, `unshare --help` probing failures, or
/// `newuidmap`/`newgidmap` failures in async mode.
pub fn spawn(
	self_exe: &Path, child_args: &[String], uid_mappings: [IdMapping; 2], gid_mappings: [IdMapping; 2],
	async_mode: bool,
) -> Result<(Child, ChildGuard)> {
	let child = if async_mode {
		let mut cmd = async_command(self_exe, child_args);
		cmd.stdin(Stdio::null());
		let child = cmd.spawn()?;
		std::thread::sleep(ASYNC_MAP_DELAY);
		apply_external_maps(Pid::from_raw(i32::try_from(child.id()).unwrap_or(0)), &uid_mappings, &gid_mappings)?;
		child
	} else {
		let syntax = probe_helper()?;
		let mut cmd = sync_command(syntax, &uid_mappings, &gid_mappings, self_exe, child_args);
		cmd.stdin(Stdio::null());
		cmd.spawn()?
	};

	let guard = track_child(&child);
	Ok((child, guard))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identity::SubRange;

	#[test]
	fn detects_comma_syntax_from_help_text() {
		let help = "--map-users=<outer>,<inner>,<count> Specify the user ID mapping";
		assert_eq!(HelperSyntax::detect(help), HelperSyntax::OuterInnerCount);
	}

	#[test]
	fn falls_back_to_colon_syntax() {
		let help = "--map-users uid:loweruid:count Specify the user ID mapping";
		assert_eq!(HelperSyntax::detect(help), HelperSyntax::InnerOuterCount);
	}

	#[test]
	fn builds_zero_and_subrange_mappings() {
		let mappings = build_mappings(1000, SubRange { start: 100_000, count: 65536 });
		assert_eq!(mappings[0], IdMapping { inner_start: 0, outer_start: 1000, count: 1 });
		assert_eq!(mappings[1], IdMapping { inner_start: 1, outer_start: 100_000, count: 65536 });
	}

	#[test]
	fn formats_both_grammars() {
		let mapping = IdMapping { inner_start: 1, outer_start: 100_000, count: 65536 };
		assert_eq!(HelperSyntax::InnerOuterCount.format(mapping), "1:100000:65536");
		assert_eq!(HelperSyntax::OuterInnerCount.format(mapping), "100000,1,65536");
	}

	#[test]
	fn sync_command_includes_both_map_options() {
		let mappings = build_mappings(1000, SubRange { start: 100_000, count: 65536 });
		let cmd = sync_command(
			HelperSyntax::InnerOuterCount,
			&mappings,
			&mappings,
			Path::new("/usr/bin/aimager"),
			&["--internal-child".to_owned()],
		);
		let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
		assert!(args.iter().any(|a| a.starts_with("--map-users=")));
		assert!(args.iter().any(|a| a.starts_with("--map-groups=")));
		assert!(args.iter().any(|a| a == "--internal-child"));
	}
}
