//! Caller identity and subordinate id range resolution (spec §4.5 pre-checks).
//!
//! `aimager` refuses to run as real root (the whole point of the exercise is
//! to appear as root only inside the user namespace) and needs a contiguous
//! block of at least 65535 subordinate uids/gids to map into it.

use std::{fs, path::Path};

use color_eyre::Result;
use nix::unistd::{Gid, Uid};

use crate::error::AimagerError;

pub const MIN_SUBRANGE: u64 = 65535;

#[derive(Debug, Clone)]
pub struct Caller {
	pub uid: Uid,
	pub gid: Gid,
	pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRange {
	pub start: u64,
	pub count: u64,
}

/// Reads the current process's identity and rejects real root (§4.5:
/// "Caller must not be real root (uid, gid, and name must all be non-root)").
///
/// # Errors
/// Returns [`AimagerError::Environment`] if running as uid 0, gid 0, or the
/// name `root`.
pub fn current_caller() -> Result<Caller> {
	let uid = nix::unistd::getuid();
	let gid = nix::unistd::getgid();
	let name = nix::unistd::User::from_uid(uid)?.map_or_else(|| uid.to_string(), |u| u.name);

	if uid.is_root() || gid.as_raw() == 0 || name == "root" {
		return Err(
			AimagerError::environment("aimager must not be run as real root (uid/gid/name 0/\"root\")")
				.into(),
		);
	}
	Ok(Caller { uid, gid, name })
}

/// Parses `/etc/subuid` or `/etc/subgid`, looking the caller up first by
/// name, then (per Linux subuid tooling behaviour) by numeric id, and
/// returns every `start:count` range recorded for them.
///
/// Per §9's design notes, if neither the name nor the numeric id is present
/// we fail outright rather than falling back to any partial match.
///
/// # Errors
/// Returns [`AimagerError::Environment`] if the file is unreadable or the
/// caller has no entry.
pub fn lookup_subid_ranges(path: &Path, name: &str, numeric_id: u64) -> Result<Vec<SubRange>> {
	let contents = fs::read_to_string(path)
		.map_err(|e| AimagerError::Environment(format!("cannot read {}: {e}", path.display())))?;

	let by_key = |key: &str| -> Vec<SubRange> {
		contents
			.lines()
			.filter_map(|line| {
				let mut parts = line.splitn(3, ':');
				let (owner, start, count) = (parts.next()?, parts.next()?, parts.next()?);
				if owner != key {
					return None;
				}
				Some(SubRange { start: start.parse().ok()?, count: count.parse().ok()? })
			})
			.collect()
	};

	let by_name = by_key(name);
	if !by_name.is_empty() {
		return Ok(by_name);
	}
	let by_id = by_key(&numeric_id.to_string());
	if !by_id.is_empty() {
		return Ok(by_id);
	}
	Err(AimagerError::Environment(format!(
		"no entry for `{name}` (uid/gid {numeric_id}) in {}",
		path.display()
	))
	.into())
}

/// Picks the first range with at least [`MIN_SUBRANGE`] contiguous ids.
///
/// # Errors
/// Returns [`AimagerError::Environment`] if no range is large enough.
pub fn require_contiguous_range(ranges: &[SubRange]) -> Result<SubRange> {
	ranges
		.iter()
		.find(|r| r.count >= MIN_SUBRANGE)
		.copied()
		.ok_or_else(|| {
			AimagerError::Environment(format!(
				"no subordinate id range of at least {MIN_SUBRANGE} contiguous ids is available"
			))
			.into()
		})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_subuid(contents: &str) -> tempfile::NamedTempFile {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(contents.as_bytes()).unwrap();
		f
	}

	#[test]
	fn looks_up_by_name_first() {
		let f = write_subuid("someoneelse:100000:65536\nalice:200000:65536\n");
		let ranges = lookup_subid_ranges(f.path(), "alice", 1000).unwrap();
		assert_eq!(ranges, vec![SubRange { start: 200_000, count: 65536 }]);
	}

	#[test]
	fn falls_back_to_numeric_uid_when_name_absent() {
		let f = write_subuid("1000:300000:65536\n");
		let ranges = lookup_subid_ranges(f.path(), "alice", 1000).unwrap();
		assert_eq!(ranges, vec![SubRange { start: 300_000, count: 65536 }]);
	}

	#[test]
	fn fails_when_neither_name_nor_id_present() {
		let f = write_subuid("bob:400000:65536\n");
		assert!(lookup_subid_ranges(f.path(), "alice", 1000).is_err());
	}

	#[test]
	fn rejects_range_smaller_than_min() {
		let ranges = vec![SubRange { start: 100_000, count: 1000 }];
		assert!(require_contiguous_range(&ranges).is_err());
	}

	#[test]
	fn accepts_first_sufficiently_large_range() {
		let ranges =
			vec![SubRange { start: 100_000, count: 1000 }, SubRange { start: 200_000, count: 65536 }];
		let r = require_contiguous_range(&ranges).unwrap();
		assert_eq!(r.start, 200_000);
	}
}
