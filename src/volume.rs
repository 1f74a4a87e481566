//! Volume path normalization.
//!
//! The driver keys its mounted-volume list on canonical object
//! namespace paths ("\Device\Harddisk1\Partition2", "\??\C:\vol.vg"),
//! so every user-supplied identifier (drive letters, UNC, volume GUID
//! paths, raw device paths) has to be resolved before a mount attempt
//! or a membership check. Resolution order and fallbacks follow the
//! driver's expectations, not filesystem conventions.

use std::path::Path;

use crate::driver::control;
use crate::os::{DeviceChannel, SystemEnv};

/// Upper bounds of the Harddisk/Partition namespace scan.
pub const MAX_HOST_DRIVES: u32 = 64;
pub const MAX_HOST_PARTITIONS: u32 = 32;

pub const LONG_PATH_PREFIX: &str = r"\\?\";
const DEVICE_PREFIX: &str = r"\Device\";

pub fn strip_long_path_prefix(path: &str) -> &str {
    path.strip_prefix(LONG_PATH_PREFIX).unwrap_or(path)
}

/// True for "Volume{...}\" forms (long-path prefix already stripped).
fn is_volume_guid_form(path: &str) -> bool {
    path.starts_with("Volume{") && path.ends_with(r"}\")
}

/// Resolve a volume GUID path to its underlying device, preferring the
/// "\Device\HarddiskN\PartitionM" form when a partition link matches.
///
/// Returns `None` when the input is not a GUID path or the DOS device
/// query fails; callers fall through to the path as given.
pub fn volume_guid_path_to_device_path(
    env: &dyn SystemEnv,
    chan: &dyn DeviceChannel,
    volume_guid_path: &str,
) -> Option<String> {
    let stripped = strip_long_path_prefix(volume_guid_path);
    if !is_volume_guid_form(stripped) {
        return None;
    }
    // "Volume{...}\" -> "Volume{...}" for the DOS device table
    let dos_name = &stripped[..stripped.len() - 1];
    let volume_device = env.dos_device_target(dos_name)?;
    Some(
        harddisk_volume_path_to_partition_path(chan, &volume_device)
            .unwrap_or(volume_device),
    )
}

/// Scan partition links for one whose resolved target equals the given
/// volume device path. A drive whose partition 0 does not resolve has
/// no further partitions.
pub fn harddisk_volume_path_to_partition_path(
    chan: &dyn DeviceChannel,
    harddisk_volume_path: &str,
) -> Option<String> {
    for drive in 0..MAX_HOST_DRIVES {
        for part in 0..MAX_HOST_PARTITIONS {
            let partition_path = format!(r"\Device\Harddisk{drive}\Partition{part}");
            match control::resolved_symlink(chan, &partition_path) {
                Some(resolved) => {
                    if resolved.eq_ignore_ascii_case(harddisk_volume_path) {
                        return Some(partition_path);
                    }
                }
                None if part == 0 => break,
                None => {}
            }
        }
    }
    None
}

/// Canonical driver-side name for a user-supplied volume path, plus
/// whether it denotes a device (as opposed to a container file).
///
/// Device paths pass through; everything else becomes a "\??\" DOS
/// namespace reference, with UNC shares rewritten to the "UNC" device.
pub fn canonical_volume_path(
    env: &dyn SystemEnv,
    chan: &dyn DeviceChannel,
    user_path: &str,
) -> (String, bool) {
    let mut path = strip_long_path_prefix(user_path).to_string();

    if is_volume_guid_form(&path) {
        if let Some(resolved) = volume_guid_path_to_device_path(env, chan, &path) {
            path = resolved;
        }
    }

    if has_device_prefix(&path) {
        return (path, true);
    }

    if let Some(share) = path.strip_prefix(r"\\") {
        return (format!(r"\??\UNC\{share}"), false);
    }

    (format!(r"\??\{path}"), false)
}

fn has_device_prefix(path: &str) -> bool {
    path.get(..DEVICE_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(DEVICE_PREFIX))
}

/// Membership check against the driver's mounted-volume list, keyed on
/// the canonical name. Comparison is case-insensitive, matching the
/// object namespace.
pub fn is_mounted_volume(env: &dyn SystemEnv, chan: &dyn DeviceChannel, volume_path: &str) -> bool {
    let (canonical, _) = canonical_volume_path(env, chan, volume_path);
    let list = match control::mounted_volumes(chan) {
        Ok(list) => list,
        Err(_) => return false,
    };
    list.volumes
        .iter()
        .any(|v| !v.is_empty() && v.eq_ignore_ascii_case(&canonical))
}

/// Whether the volume identifier points at something that exists:
/// device paths are probed through the driver, GUID paths through the
/// DOS device table, plain paths through the filesystem.
pub fn volume_path_exists(env: &dyn SystemEnv, chan: &dyn DeviceChannel, volume_path: &str) -> bool {
    let path = strip_long_path_prefix(volume_path);

    if has_device_prefix(path) {
        return control::open_test(chan, path, false, false).is_some();
    }

    if is_volume_guid_form(path) {
        return env.dos_device_target(&path[..path.len() - 1]).is_some();
    }

    env.file_exists(Path::new(path))
}

/// Extract the drive ordinal from "\Device\HarddiskN\Partition..." paths.
pub fn harddisk_number(device_path: &str) -> Option<i32> {
    let rest = device_path
        .strip_prefix(r"\Device\Harddisk")
        .or_else(|| device_path.strip_prefix(r"\device\harddisk"))?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let tail = &rest[digits.len()..];
    if !tail.starts_with(r"\Partition") && !tail.starts_with(r"\partition") {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_path_prefix_is_stripped() {
        assert_eq!(strip_long_path_prefix(r"\\?\D:\vol.vg"), r"D:\vol.vg");
        assert_eq!(strip_long_path_prefix(r"D:\vol.vg"), r"D:\vol.vg");
    }

    #[test]
    fn harddisk_number_parses_partition_paths_only() {
        assert_eq!(harddisk_number(r"\Device\Harddisk3\Partition1"), Some(3));
        assert_eq!(harddisk_number(r"\Device\Harddisk12\Partition0"), Some(12));
        assert_eq!(harddisk_number(r"\Device\HarddiskVolume3"), None);
        assert_eq!(harddisk_number(r"D:\vol.vg"), None);
    }

    #[test]
    fn guid_form_detection() {
        assert!(is_volume_guid_form(r"Volume{1234-abcd}\"));
        assert!(!is_volume_guid_form(r"Volume{1234-abcd}"));
        assert!(!is_volume_guid_form(r"D:\Volume{1234}\"));
    }
}
