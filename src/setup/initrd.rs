//! Initrd maker pinning (spec §4.8 step 1): forces whichever initrd maker
//! is selected to generate a single universal image instead of per-kernel
//! variants, then restores its normal per-kernel behaviour afterwards.

use std::{fs, path::Path};

use color_eyre::Result;

use crate::{context::InitrdMaker, error::AimagerError};

const BOOSTER_CONFIG: &str = "etc/booster.yaml";
const MKINITCPIO_PRESET: &str = "etc/mkinitcpio.d/linux.preset";

/// Patches the chroot's initrd-maker configuration to produce one universal
/// image, saving whatever it overwrites as `.pacsave` so [`restore`] can put
/// it back.
///
/// # Errors
/// Returns [`AimagerError::Environment`] for `dracut` (§4.8 step 1: "not yet
/// implemented"), or propagates filesystem errors.
pub fn force_universal(chroot: &Path, maker: InitrdMaker) -> Result<()> {
	match maker {
		InitrdMaker::Booster => {
			let path = chroot.join(BOOSTER_CONFIG);
			save_pacsave(&path)?;
			crate::util::write_atomic(&path, b"universal: true\n")?;
			Ok(())
		},
		InitrdMaker::Mkinitcpio => {
			let path = chroot.join(MKINITCPIO_PRESET);
			save_pacsave(&path)?;
			let patched = patch_presets_line(&fs::read_to_string(&path).unwrap_or_default());
			crate::util::write_atomic(&path, patched.as_bytes())?;
			Ok(())
		},
		InitrdMaker::Dracut => {
			Err(AimagerError::environment("dracut initrd pinning is not yet implemented").into())
		},
	}
}

/// Re-renders `mkinitcpio`'s per-kernel `<kernel>.preset` files from the
/// saved hook template once kernels are installed, restoring the normal
/// per-kernel workflow (§4.8 step 1, last sentence).
///
/// # Errors
/// Propagates filesystem errors.
pub fn restore_per_kernel_presets(chroot: &Path, kernels: &[String]) -> Result<()> {
	let saved = chroot.join(format!("{MKINITCPIO_PRESET}.pacsave"));
	let Ok(template) = fs::read_to_string(&saved) else {
		return Ok(());
	};
	for kernel in kernels {
		let rendered = template.replace("%PKGBASE%", kernel);
		let dest = chroot.join(format!("etc/mkinitcpio.d/{kernel}.preset"));
		crate::util::write_atomic(&dest, rendered.as_bytes())?;
	}
	Ok(())
}

fn save_pacsave(path: &Path) -> Result<()> {
	if path.exists() {
		let pacsave = path.with_extension(match path.extension() {
			Some(ext) => format!("{}.pacsave", ext.to_string_lossy()),
			None => "pacsave".to_owned(),
		});
		fs::copy(path, pacsave)?;
	}
	Ok(())
}

/// Rewrites `PRESETS=(...)` to `PRESETS=('fallback')`, leaving every other
/// line untouched.
fn patch_presets_line(contents: &str) -> String {
	contents
		.lines()
		.map(|line| {
			if line.trim_start().starts_with("PRESETS=") {
				"PRESETS=('fallback')".to_owned()
			} else {
				line.to_owned()
			}
		})
		.collect::<Vec<_>>()
		.join("\n")
		+ "\n"
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dracut_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		assert!(force_universal(dir.path(), InitrdMaker::Dracut).is_err());
	}

	#[test]
	fn booster_config_is_replaced_and_backed_up() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(BOOSTER_CONFIG);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(&path, "universal: false\nstrip: true\n").unwrap();

		force_universal(dir.path(), InitrdMaker::Booster).unwrap();

		assert_eq!(fs::read_to_string(&path).unwrap(), "universal: true\n");
		assert!(path.with_extension("yaml.pacsave").exists() || dir.path().join(format!("{BOOSTER_CONFIG}.pacsave")).exists());
	}

	#[test]
	fn mkinitcpio_presets_line_is_rewritten() {
		let patched = patch_presets_line("ALL_kver=\"/boot/vmlinuz\"\nPRESETS=('default' 'fallback')\n");
		assert!(patched.contains("PRESETS=('fallback')"));
		assert!(patched.contains("ALL_kver"));
	}

	#[test]
	fn restore_is_a_no_op_without_a_saved_template() {
		let dir = tempfile::tempdir().unwrap();
		assert!(restore_per_kernel_presets(dir.path(), &["linux".to_owned()]).is_ok());
	}
}
