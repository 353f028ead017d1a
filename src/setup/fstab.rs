//! `/etc/fstab` generation from the resolved partition table (spec §4.8
//! step 4), rendered the way the teacher renders its own generated
//! configuration files: a static prepend comment plus one `tera` pass over
//! a list of entries.

use color_eyre::Result;
use serde::Serialize;
use tera::{Context, Tera};

use crate::{
	error::AimagerError,
	partition::{PartitionTable, Role},
};

const TEMPLATE: &str = include_str!("../../templates/fstab.tera");
const PREPEND: &str = "# /etc/fstab: static file system information, generated by aimager.";

#[derive(Debug, Clone, Serialize)]
struct FstabEntry {
	uuid: String,
	mountpoint: &'static str,
	fstype: &'static str,
	options: &'static str,
	pass: u8,
}

/// One row per role, in the fixed defaults table from §4.8 step 4.
fn entry_for(role: Role, uuid: String) -> FstabEntry {
	let (fstype, options, pass) = match role {
		Role::Root => ("ext4", "rw,noatime,defaults", 1),
		Role::Boot => ("vfat", "rw,defaults", 2),
		Role::Home => ("ext4", "rw,noatime,defaults", 1),
		Role::Swap => ("swap", "defaults", 0),
	};
	FstabEntry { uuid, mountpoint: role.mountpoint(), fstype, options, pass }
}

/// Renders `/etc/fstab` content for every role present in `table`.
///
/// # Errors
/// Returns an error if the embedded template fails to render.
pub fn render(table: &PartitionTable) -> Result<String> {
	let entries: Vec<FstabEntry> = table
		.partitions
		.iter()
		.map(|p| {
			let uuid = if matches!(p.role, Role::Boot) { p.fat_volume_id() } else { p.uuid.hyphenated().to_string() };
			entry_for(p.role, uuid)
		})
		.collect();

	let mut context = Context::new();
	context.insert("PREPEND", PREPEND);
	context.insert("entries", &entries);

	Tera::one_off(TEMPLATE, &context, false)
		.map_err(|e| AimagerError::parsing("fstab template", e.to_string()).into())
}

#[cfg(test)]
mod tests {
	use super::*;
	use uuid::Uuid;

	fn fixed_uuid() -> Uuid {
		Uuid::from_u128(0xaaaa_bbbb_cccc_dddd_eeee_ffff_1111_2222)
	}

	#[test]
	fn renders_one_line_per_role_keyed_by_uuid() {
		let decl = "label: gpt\naimager@boot: size=512M,type=uefi\naimager@root: size=8G,type=linux\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let rendered = render(&table).unwrap();
		assert!(rendered.contains("/boot"));
		assert!(rendered.contains("vfat"));
		assert!(rendered.contains(&table.get(crate::partition::Role::Root).unwrap().uuid.hyphenated().to_string()));
	}

	#[test]
	fn boot_entry_is_keyed_by_fat_volume_id_not_the_full_uuid() {
		let decl = "label: gpt\naimager@boot: size=512M,type=uefi\naimager@root: size=8G,type=linux\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let boot = table.get(crate::partition::Role::Boot).unwrap();
		let rendered = render(&table).unwrap();
		assert!(rendered.contains(&format!("UUID={}", boot.fat_volume_id())));
		assert!(!rendered.contains(&boot.uuid.hyphenated().to_string()));
	}

	#[test]
	fn swap_role_has_none_mountpoint_and_zero_pass() {
		let decl = "aimager@root: size=4G,type=linux\naimager@swap: size=1G,type=swap\n";
		let table = PartitionTable::parse(decl, fixed_uuid).unwrap();
		let rendered = render(&table).unwrap();
		assert!(rendered.contains("none  swap"));
	}
}
