//! Partition table model (spec §3 `Partition`/`PartitionTable`, §4.4 parser).
//!
//! The declaration format is the text accepted by `sfdisk --dump`, with
//! `aimager`-specific partition lines prefixed `aimager@<role>:`. This is a
//! closed, role-keyed table (at most one partition per role), not a general
//! sfdisk editor: `aimager` only ever needs to describe its own four roles.

use std::{collections::BTreeMap, fmt};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AimagerError;

const DEFAULT_FIRST_LBA_SECTORS: u64 = 2048;
const SECTOR_BYTES: u64 = 512;
const MIB: u64 = 1024 * 1024;
const GPT_BACKUP_RESERVE_SECTORS: u64 = 33;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Boot,
	Root,
	Home,
	Swap,
}

impl Role {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Boot => "boot",
			Self::Root => "root",
			Self::Home => "home",
			Self::Swap => "swap",
		}
	}

	#[must_use]
	pub const fn mountpoint(self) -> &'static str {
		match self {
			Self::Boot => "/boot",
			Self::Root => "/",
			Self::Home => "/home",
			Self::Swap => "none",
		}
	}

	fn from_tag(tag: &str) -> Option<Self> {
		match tag {
			"boot" => Some(Self::Boot),
			"root" => Some(Self::Root),
			"home" => Some(Self::Home),
			"swap" => Some(Self::Swap),
			_ => None,
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Label {
	Gpt,
	Dos,
}

/// GPT/MBR partition type: a handful of well-known barewords the way
/// `sfdisk --dump` prints them, falling back to any bareword or GUID the
/// caller supplied verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartitionType {
	Uefi,
	LinuxRoot,
	LinuxSwap,
	LinuxGeneric,
	Other(String),
}

impl PartitionType {
	fn parse(raw: &str) -> Self {
		match raw.to_lowercase().as_str() {
			"uefi" | "c12a7328-f81f-11d2-ba4b-00a0c93ec93b" => Self::Uefi,
			"swap" | "linux swap" => Self::LinuxSwap,
			"linux" | "linux filesystem" | "0fc63daf-8483-4772-8e79-3d69d8477de4" => {
				Self::LinuxGeneric
			},
			_ if raw.to_lowercase().starts_with("linux root") => Self::LinuxRoot,
			_ => Self::Other(raw.to_owned()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Partition {
	pub role: Role,
	pub size_mib: u64,
	pub offset_mib: u64,
	pub partition_type: PartitionType,
	pub uuid: Uuid,
	pub raw: String,
}

impl Partition {
	/// The `XXXX-XXXX` FAT volume id carved out of this partition's uuid
	/// (§3 invariant: "boot partition uuid truncated to 8 hex chars split
	/// 4-4 to fit FAT volume id").
	#[must_use]
	pub fn fat_volume_id(&self) -> String {
		let hex: String = self.uuid.simple().to_string().chars().take(8).collect();
		format!("{}-{}", &hex[..4], &hex[4..]).to_uppercase()
	}

	#[must_use]
	pub fn end_mib(&self) -> u64 {
		self.offset_mib + self.size_mib
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionTable {
	pub label: Label,
	pub partitions: Vec<Partition>,
	pub first_lba: Option<u64>,
	pub last_lba: Option<u64>,
}

impl Default for PartitionTable {
	fn default() -> Self {
		Self { label: Label::Dos, partitions: Vec::new(), first_lba: None, last_lba: None }
	}
}

impl PartitionTable {
	/// Parses an `sfdisk --dump`-like declaration (§4.4). `uuid_source` lets
	/// tests inject deterministic uuids (§9 design-notes open question).
	///
	/// # Errors
	/// Returns [`AimagerError::Parsing`] on a malformed size suffix and
	/// [`AimagerError::Configuration`] on a duplicate role.
	pub fn parse(declaration: &str, uuid_source: impl Fn() -> Uuid) -> Result<Self> {
		let mut label = Label::Dos;
		let mut first_lba = None;
		let mut last_lba = None;
		let mut entries: Vec<(Role, BTreeMap<String, String>, String)> = Vec::new();

		for line in declaration.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			if let Some(rest) = line.strip_prefix("label:") {
				label = match rest.trim() {
					"gpt" => Label::Gpt,
					_ => Label::Dos,
				};
				continue;
			}
			if let Some(rest) = line.strip_prefix("first-lba:") {
				first_lba = Some(parse_u64(rest.trim())?);
				continue;
			}
			if let Some(rest) = line.strip_prefix("last-lba:") {
				last_lba = Some(parse_u64(rest.trim())?);
				continue;
			}
			if let Some(rest) = line.strip_prefix("aimager@") {
				let Some((role_tag, fields)) = rest.split_once(':') else {
					return Err(
						AimagerError::parsing("partition table", format!("missing ':' in `{line}`"))
							.into(),
					);
				};
				let role = Role::from_tag(role_tag.trim()).ok_or_else(|| {
					AimagerError::parsing("partition table", format!("unknown role `{role_tag}`"))
				})?;
				if entries.iter().any(|(r, ..)| *r == role) {
					return Err(
						AimagerError::configuration(format!("duplicate partition role `{role}`")).into(),
					);
				}
				let parsed = parse_fields(fields)?;
				entries.push((role, parsed, line.to_owned()));
			}
		}

		if entries.is_empty() {
			return Err(AimagerError::parsing("partition table", "no `aimager@` partition lines found").into());
		}

		let mut cursor_mib = first_lba.map_or(DEFAULT_FIRST_LBA_SECTORS, |s| s) * SECTOR_BYTES / MIB;
		if cursor_mib == 0 {
			cursor_mib = 1;
		}

		let mut partitions = Vec::with_capacity(entries.len());
		for (role, fields, raw) in entries {
			let size_mib = fields
				.get("size")
				.map(|s| parse_size_mib(s))
				.transpose()?
				.ok_or_else(|| AimagerError::parsing("partition table", format!("{role}: missing size=")))?;
			let offset_mib = match fields.get("offset") {
				Some(s) => parse_size_mib(s)?,
				None => cursor_mib,
			};
			let partition_type = fields
				.get("type")
				.map(|s| PartitionType::parse(s.trim_matches('"')))
				.unwrap_or(PartitionType::LinuxGeneric);

			let uuid = if role == Role::Boot {
				uuid_source()
			} else {
				fields.get("uuid").and_then(|s| Uuid::parse_str(s).ok()).unwrap_or_else(&uuid_source)
			};

			cursor_mib = offset_mib + size_mib;
			partitions.push(Partition { role, size_mib, offset_mib, partition_type, uuid, raw });
		}
		partitions.sort_by_key(|p| p.offset_mib);

		Ok(Self { label, partitions, first_lba, last_lba })
	}

	/// Total disk size in MiB (§3 invariant / §8 testable property 3 & scenario 4).
	#[must_use]
	pub fn disk_size_mib(&self) -> u64 {
		if let Some(last_lba) = self.last_lba {
			let reserve = if self.label == Label::Gpt { GPT_BACKUP_RESERVE_SECTORS } else { 0 };
			let bytes = (last_lba + reserve + 1) * SECTOR_BYTES;
			return bytes.div_ceil(MIB);
		}
		let max_end = self.partitions.iter().map(Partition::end_mib).max().unwrap_or(0);
		if self.label == Label::Gpt {
			max_end + 1
		} else {
			max_end
		}
	}

	#[must_use]
	pub fn get(&self, role: Role) -> Option<&Partition> {
		self.partitions.iter().find(|p| p.role == role)
	}
}

fn parse_fields(fields: &str) -> Result<BTreeMap<String, String>> {
	let mut map = BTreeMap::new();
	for field in fields.split(',') {
		let field = field.trim();
		if field.is_empty() {
			continue;
		}
		let Some((key, value)) = field.split_once('=') else {
			return Err(AimagerError::parsing("partition table", format!("malformed field `{field}`")).into());
		};
		map.insert(key.trim().to_owned(), value.trim().to_owned());
	}
	Ok(map)
}

/// Named table presets for `--table =<preset>` (§4.4 `[SUPPLEMENT]`): §4.4
/// only specifies the grammar for an already-resolved declaration string,
/// while §6 names `--table =preset` as part of the surface. This is a tiny
/// starter set, not a general layout catalog.
const TABLE_PRESETS: &[(&str, &str)] = &[
	("efi_generic", "label: gpt\naimager@boot: size=512M,type=uefi\naimager@root: size=8G,type=linux\n"),
	(
		"efi_boot_root_home",
		"label: gpt\naimager@boot: size=512M,type=uefi\naimager@root: size=16G,type=linux\naimager@home: size=16G,type=linux\n",
	),
];

/// Looks up a named table preset's raw declaration text.
#[must_use]
pub fn preset(tag: &str) -> Option<&'static str> {
	TABLE_PRESETS.iter().find(|(name, _)| *name == tag).map(|(_, decl)| *decl)
}

/// Every known table preset tag, for `--table help`.
#[must_use]
pub fn preset_tags() -> Vec<&'static str> {
	TABLE_PRESETS.iter().map(|(name, _)| *name).collect()
}

fn parse_u64(s: &str) -> Result<u64> {
	s.parse::<u64>()
		.map_err(|_| eyre!(AimagerError::parsing("partition table", format!("`{s}` is not an integer"))))
}

/// Parses a size token: bare integer = sectors, or `<number><K|M|G|T|P|E>`
/// with an optional cosmetic `iB`/`ib`/`B`/`b` suffix, all treated as
/// binary (1024-based) multiples. Result rounded up to whole MiB.
fn parse_size_mib(raw: &str) -> Result<u64> {
	let raw = raw.trim();
	let bad = || AimagerError::parsing("partition size", format!("unknown size suffix in `{raw}`"));

	let Some(unit_start) = raw.find(|c: char| c.is_ascii_alphabetic()) else {
		// bare integer: sectors
		let sectors: u64 = raw.parse().map_err(|_| bad())?;
		return Ok((sectors * SECTOR_BYTES).div_ceil(MIB).max(1));
	};

	let (number, suffix) = raw.split_at(unit_start);
	let number: f64 = number.parse().map_err(|_| bad())?;
	let unit = suffix.chars().next().ok_or_else(bad)?.to_ascii_uppercase();
	let rest = &suffix[1..];
	if !rest.is_empty() && !matches!(rest, "iB" | "ib" | "IB" | "Ib" | "B" | "b") {
		return Err(bad().into());
	}

	let multiplier_bytes = match unit {
		'K' => bytesize::KIB,
		'M' => bytesize::MIB,
		'G' => bytesize::GIB,
		'T' => bytesize::TIB,
		'P' => bytesize::PIB,
		'E' => bytesize::PIB.saturating_mul(1024),
		_ => return Err(bad().into()),
	};

	let bytes = number * multiplier_bytes as f64;
	Ok((bytes / bytesize::MIB as f64).ceil() as u64)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fixed_uuid() -> Uuid {
		Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0)
	}

	#[test]
	fn scenario_4_two_partition_layout() {
		let decl = r#"
label: gpt
aimager@boot: size=1G,type=uefi
aimager@root: size=16G,type="Linux root (x86-64)"
"#;
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		assert_eq!(table.partitions.len(), 2);
		let boot = table.get(Role::Boot).unwrap();
		let root = table.get(Role::Root).unwrap();
		assert_eq!(boot.size_mib, 1024);
		assert_eq!(boot.offset_mib, 1);
		assert_eq!(root.size_mib, 16384);
		assert_eq!(root.offset_mib, 1025);
		assert_eq!(table.disk_size_mib(), 17410);
	}

	#[test]
	fn round_trip_without_last_lba_matches_max_offset_plus_size() {
		let decl = "label: gpt\naimager@root: size=8G,type=linux\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let expected = table.partitions.iter().map(Partition::end_mib).max().unwrap() + 1;
		assert_eq!(table.disk_size_mib(), expected);
	}

	#[test]
	fn dos_label_has_no_gpt_footer_reserve() {
		let decl = "aimager@root: size=1G,type=linux\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		assert_eq!(table.label, Label::Dos);
		assert_eq!(table.disk_size_mib(), table.partitions[0].end_mib());
	}

	#[test]
	fn duplicate_role_is_rejected() {
		let decl = "label: gpt\naimager@boot: size=1G,type=uefi\naimager@boot: size=1G,type=uefi\n";
		assert!(PartitionTable::parse(decl, fixed_uuid).is_err());
	}

	#[test]
	fn unknown_size_suffix_is_rejected() {
		assert!(parse_size_mib("3Q").is_err());
	}

	#[test]
	fn sector_sizes_round_up_to_whole_mib() {
		// 1 sector = 512 bytes, rounds up to 1 MiB
		assert_eq!(parse_size_mib("1").unwrap(), 1);
	}

	#[test]
	fn known_table_presets_parse_successfully() {
		for tag in preset_tags() {
			let decl = preset(tag).unwrap();
			assert!(PartitionTable::parse(decl, fixed_uuid).is_ok(), "preset {tag} failed to parse");
		}
	}

	#[test]
	fn unknown_preset_returns_none() {
		assert!(preset("not-a-preset").is_none());
	}

	#[test]
	fn boot_uuid_truncates_to_fat_volume_id_form() {
		let decl = "label: gpt\naimager@boot: size=128M,type=uefi\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let boot = table.get(Role::Boot).unwrap();
		let vol_id = boot.fat_volume_id();
		assert_eq!(vol_id.len(), 9);
		assert_eq!(vol_id.chars().nth(4), Some('-'));
	}
}
