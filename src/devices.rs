//! Host drive and partition enumeration.
//!
//! Walks the bounded Harddisk/Partition namespace with driver-side
//! open probes, detects the synthetic "partition 1" some storage
//! devices expose without a partition table, and resolves per-device
//! properties against the live drive-letter table. Also owns the
//! one-time discovery of the system partition/drive device paths.
//!
//! Key responsibilities:
//! - Build the candidate device list for mounting and formatting UIs.
//! - Merge virtual partitions into their drive-level entry.
//! - Scan dynamic volumes on OS generations without partition links.
//! - Memoize the system device paths for fast destructive-op checks.

use log::debug;

use crate::driver::control;
use crate::os::{DeviceChannel, OsVersion, SystemEnv};
use crate::volume::{MAX_HOST_DRIVES, MAX_HOST_PARTITIONS};

/// HarddiskVolumeN scan bound for the dynamic-volume pass.
pub const MAX_DYNAMIC_VOLUMES: u32 = 256;

/// Boot partitions above this size are regular system partitions, not
/// the small extra boot partition newer installers create.
pub const EXTRA_BOOT_PARTITION_MAX_SIZE: u64 = 512 * 1024 * 1024;

/// One enumerated drive, partition or dynamic volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDevice {
    /// Drive ordinal for drive-level entries, partition or volume
    /// number for the rest.
    pub system_number: u32,
    pub path: String,
    pub mount_point: Option<String>,
    pub name: Option<String>,
    pub size: u64,
    pub bootable: bool,
    pub removable: bool,
    pub contains_system: bool,
    pub is_partition: bool,
    pub is_virtual_partition: bool,
    pub dynamic_volume: bool,
    pub has_unencrypted_filesystem: bool,
    pub partitions: Vec<HostDevice>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnumerateOptions {
    /// Skip mount point / label / geometry resolution for speed.
    pub no_device_properties: bool,
    /// Also append partition entries to the flat result list.
    pub single_list: bool,
    /// Ask the driver to sniff foreign filesystem signatures.
    pub detect_unencrypted_filesystems: bool,
}

/// Drive number (0 = A:) whose DOS device resolves to `device_path`,
/// directly or through the object-namespace link.
pub fn disk_device_drive_letter(
    env: &dyn SystemEnv,
    chan: &dyn DeviceChannel,
    device_path: &str,
) -> Option<u8> {
    let resolved = control::resolved_symlink(chan, device_path);
    let drives = env.logical_drives();
    for drive_no in 0..26u8 {
        if drives & (1 << drive_no) == 0 {
            continue;
        }
        let dos_name = format!("{}:", (b'A' + drive_no) as char);
        let Some(target) = env.dos_device_target(&dos_name) else {
            continue;
        };
        if target.eq_ignore_ascii_case(device_path) {
            return Some(drive_no);
        }
        if let Some(resolved) = &resolved {
            if target.eq_ignore_ascii_case(resolved) {
                return Some(drive_no);
            }
        }
    }
    None
}

fn resolve_properties(
    env: &dyn SystemEnv,
    chan: &dyn DeviceChannel,
    device: &mut HostDevice,
) {
    if let Some(drive_no) = disk_device_drive_letter(env, chan, &device.path) {
        let letter = (b'A' + drive_no) as char;
        device.mount_point = Some(format!("{letter}:"));
        device.name = env.volume_label(drive_no);
        if env.system_drive_letter() == Some(letter) {
            device.contains_system = true;
        }
    }
}

/// Walk the host drive/partition namespace and build the device list.
pub fn enumerate_host_devices(
    env: &dyn SystemEnv,
    chan: &dyn DeviceChannel,
    os: &OsVersion,
    opts: &EnumerateOptions,
) -> Vec<HostDevice> {
    let mut devices: Vec<HostDevice> = Vec::new();
    let mut dev0 = 0usize;

    for drive in 0..MAX_HOST_DRIVES {
        for part in 0..MAX_HOST_PARTITIONS {
            let path = format!(r"\Device\Harddisk{drive}\Partition{part}");
            let probe = control::open_test(
                chan,
                &path,
                opts.detect_unencrypted_filesystems && part != 0,
                false,
            );
            let Some(probe) = probe else {
                // Partition 0 failing to open means the drive itself
                // is absent.
                if part == 0 {
                    break;
                }
                continue;
            };

            let mut device = HostDevice {
                system_number: drive,
                path: path.clone(),
                ..HostDevice::default()
            };

            if let Some(info) = control::partition_info(chan, &path) {
                device.bootable = info.bootable;
                device.size = info.partition_len;
            }
            device.has_unencrypted_filesystem =
                opts.detect_unencrypted_filesystems && probe.filesystem_detected;

            if !opts.no_device_properties {
                resolve_properties(env, chan, &mut device);
                if part == 0 {
                    if let Some(geo) = control::drive_geometry(chan, &path) {
                        device.removable = geo.removable_media;
                    }
                }
            }

            if part == 0 {
                devices.push(device);
                dev0 = devices.len() - 1;
                continue;
            }

            // Some storage devices without a partition table get a
            // virtual partition 1 whose size equals the whole drive.
            // Fold it into the drive entry so the device is listed
            // once, under the drive identity but with the partition's
            // mount point and path.
            if part == 1 && devices[dev0].size == device.size {
                let drive_entry = &mut devices[dev0];
                drive_entry.is_virtual_partition = true;
                drive_entry.mount_point = device.mount_point.clone();
                drive_entry.name = device.name.clone();
                drive_entry.path = device.path.clone();
                drive_entry.has_unencrypted_filesystem = device.has_unencrypted_filesystem;
                break;
            }

            device.is_partition = true;
            device.system_number = part;
            device.removable = devices[dev0].removable;
            if device.contains_system {
                devices[dev0].contains_system = true;
            }
            if opts.single_list {
                devices.push(device.clone());
            }
            devices[dev0].partitions.push(device);
        }
    }

    // Partition links are not created for dynamic volumes, so those
    // are reachable only through their HarddiskVolume devices.
    if os.supports_dynamic_volumes() {
        for vol in 0..MAX_DYNAMIC_VOLUMES {
            let path = format!(r"\Device\HarddiskVolume{vol}");
            let Some(probe) =
                control::open_test(chan, &path, opts.detect_unencrypted_filesystems, false)
            else {
                continue;
            };
            let Some(info) = control::partition_info(chan, &path) else {
                continue;
            };
            if !info.is_dynamic {
                continue;
            }
            let mut device = HostDevice {
                system_number: vol,
                path,
                size: info.partition_len,
                is_partition: true,
                dynamic_volume: true,
                has_unencrypted_filesystem: opts.detect_unencrypted_filesystems
                    && probe.filesystem_detected,
                ..HostDevice::default()
            };
            if !opts.no_device_properties {
                resolve_properties(env, chan, &mut device);
            }
            devices.push(device);
        }
    }

    debug!(target: "volgate::devices", "enumerated {} host device(s)", devices.len());
    devices
}

// ── system device paths ─────────────────────────────────────────────

/// Memoized result of the system partition/drive discovery. Populated
/// once per context lifetime; invalidated only explicitly, so it goes
/// stale if partitions change mid-session.
#[derive(Debug, Clone, Default)]
pub struct SysDevicePathCache {
    pub valid: bool,
    pub system_partition: String,
    pub system_drive: String,
    pub extra_boot_partition: Option<String>,
}

impl SysDevicePathCache {
    pub fn is_populated(&self) -> bool {
        self.valid && self.system_partition.len() > 1 && self.system_drive.len() > 1
    }

    pub fn invalidate(&mut self) {
        *self = SysDevicePathCache::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemPathKind {
    NotSystem,
    SystemPartition,
    SystemDrive,
    ExtraBootPartition,
}

/// Full enumeration pass that locates the system partition, the system
/// drive, and (on newer OS generations) the extra boot partition.
/// Slow; meant to run once and be cached.
pub fn discover_sys_device_paths(
    env: &dyn SystemEnv,
    chan: &dyn DeviceChannel,
    os: &OsVersion,
) -> SysDevicePathCache {
    let mut cache = SysDevicePathCache::default();

    let flat = EnumerateOptions { single_list: true, ..EnumerateOptions::default() };
    for device in enumerate_host_devices(env, chan, os, &flat) {
        if device.contains_system {
            if device.is_partition {
                cache.system_partition = device.path;
            } else {
                cache.system_drive = device.path;
            }
        }
    }

    if os.is_at_least_win7() {
        let nested = EnumerateOptions::default();
        for drive in enumerate_host_devices(env, chan, os, &nested) {
            if !drive.contains_system {
                continue;
            }
            if let Some(boot) = drive.partitions.iter().find(|p| p.bootable) {
                if boot.size <= EXTRA_BOOT_PARTITION_MAX_SIZE {
                    cache.extra_boot_partition = Some(boot.path.clone());
                }
            }
            break;
        }
    }

    cache.valid = true;
    debug!(
        target: "volgate::devices",
        "system device paths: partition={:?} drive={:?} extra_boot={:?}",
        cache.system_partition, cache.system_drive, cache.extra_boot_partition
    );
    cache
}

/// Classify a device path against a populated cache. Returns `None`
/// when the cache cannot answer reliably.
pub fn classify_system_path(cache: &SysDevicePathCache, path: &str) -> Option<SystemPathKind> {
    if !cache.is_populated() {
        return None;
    }
    if path.eq_ignore_ascii_case(&cache.system_partition) {
        Some(SystemPathKind::SystemPartition)
    } else if path.eq_ignore_ascii_case(&cache.system_drive) {
        Some(SystemPathKind::SystemDrive)
    } else if cache
        .extra_boot_partition
        .as_deref()
        .is_some_and(|p| p.eq_ignore_ascii_case(path))
    {
        Some(SystemPathKind::ExtraBootPartition)
    } else {
        Some(SystemPathKind::NotSystem)
    }
}
