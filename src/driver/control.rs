//! Control-request channel: request codes, fixed-layout wire structs
//! and the typed helpers the transactions are built from.
//!
//! Every driver exchange is one synchronous device-control transaction
//! with a fixed-size request/response pair. This module only moves
//! bytes; it does not validate payload schemas beyond the layouts
//! defined here. All integers are little-endian, paths travel as
//! NUL-padded UTF-16.

use zeroize::Zeroize;

use crate::error::{ControlError, Result};
use crate::os::{DeviceChannel, TransportError};
use crate::password::SecretBlock;

/// Fixed wide-path capacity of every path-carrying request.
pub const MAX_WIDE_PATH: usize = 260;

// ── request codes ───────────────────────────────────────────────────

const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

/// Standard CTL_CODE layout, custom function range 0x800+.
const fn ctl_code(function: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (FILE_ANY_ACCESS << 14) | ((0x800 + function) << 2) | METHOD_BUFFERED
}

pub mod codes {
    use super::ctl_code;

    pub const GET_DRIVER_VERSION: u32 = ctl_code(1);
    pub const LEGACY_GET_DRIVER_VERSION: u32 = ctl_code(2);
    pub const MOUNT_VOLUME: u32 = ctl_code(3);
    pub const DISMOUNT_VOLUME: u32 = ctl_code(4);
    pub const GET_MOUNTED_VOLUMES: u32 = ctl_code(5);
    pub const LEGACY_GET_MOUNTED_VOLUMES: u32 = ctl_code(6);
    pub const IS_ANY_VOLUME_MOUNTED: u32 = ctl_code(7);
    pub const GET_DEVICE_REFCOUNT: u32 = ctl_code(8);
    pub const SET_PORTABLE_MODE_STATUS: u32 = ctl_code(9);
    pub const OPEN_TEST: u32 = ctl_code(10);
    pub const GET_DRIVE_PARTITION_INFO: u32 = ctl_code(11);
    pub const GET_DRIVE_GEOMETRY: u32 = ctl_code(12);
    pub const GET_RESOLVED_SYMLINK: u32 = ctl_code(13);
    pub const GET_PASSWORD_CACHE_STATUS: u32 = ctl_code(14);
    pub const GET_VOLUME_PROPERTIES: u32 = ctl_code(15);
}

// ── driver return codes ─────────────────────────────────────────────

/// Return code written by the driver into the request it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStatus(pub i32);

impl DriverStatus {
    pub const SUCCESS: DriverStatus = DriverStatus(0);
    pub const OS_ERROR: DriverStatus = DriverStatus(1);
    pub const OUT_OF_MEMORY: DriverStatus = DriverStatus(2);
    pub const WRONG_PASSWORD: DriverStatus = DriverStatus(3);
    pub const BAD_VOLUME_FORMAT: DriverStatus = DriverStatus(4);
    pub const DRIVE_NOT_FOUND: DriverStatus = DriverStatus(5);
    pub const FILES_OPEN: DriverStatus = DriverStatus(6);
    pub const MOUNT_FAILED: DriverStatus = DriverStatus(7);
    pub const VOLUME_SIZE_WRONG: DriverStatus = DriverStatus(8);
    pub const PARAMETER_INCORRECT: DriverStatus = DriverStatus(9);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            DriverStatus::SUCCESS => "success",
            DriverStatus::OS_ERROR => "os error",
            DriverStatus::OUT_OF_MEMORY => "out of memory",
            DriverStatus::WRONG_PASSWORD => "wrong password",
            DriverStatus::BAD_VOLUME_FORMAT => "bad volume format",
            DriverStatus::DRIVE_NOT_FOUND => "drive not found",
            DriverStatus::FILES_OPEN => "files open",
            DriverStatus::MOUNT_FAILED => "mount failed",
            DriverStatus::VOLUME_SIZE_WRONG => "volume size wrong",
            DriverStatus::PARAMETER_INCORRECT => "parameter incorrect",
            DriverStatus(other) => return write!(f, "driver code {other}"),
        };
        f.write_str(name)
    }
}

/// Volume modes of operation reported by GET_VOLUME_PROPERTIES.
pub mod modes {
    pub const XTS: u32 = 1;
    pub const LRW: u32 = 2;
    pub const CBC: u32 = 3;
    pub const OUTER_CBC: u32 = 4;
}

// ── little-endian plumbing ──────────────────────────────────────────

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_secret(buf: &mut Vec<u8>, block: &SecretBlock) {
    put_u32(buf, block.len);
    buf.extend_from_slice(&block.text);
    buf.extend_from_slice(&[0u8; 3]); // alignment pad
}

fn put_wide_path(buf: &mut Vec<u8>, path: &[u16; MAX_WIDE_PATH]) {
    for unit in path {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

/// Out-of-range reads yield zero; the driver contract fixes response
/// sizes, so a short buffer only ever means a zero-filled tail.
fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = buf.get(off + i).copied().unwrap_or(0);
    }
    u32::from_le_bytes(raw)
}

fn i32_at(buf: &[u8], off: usize) -> i32 {
    u32_at(buf, off) as i32
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = buf.get(off + i).copied().unwrap_or(0);
    }
    u64::from_le_bytes(raw)
}

fn wide_at(buf: &[u8], off: usize) -> String {
    let mut units = Vec::with_capacity(MAX_WIDE_PATH);
    for i in 0..MAX_WIDE_PATH {
        let unit = u32_at(buf, off + i * 2) as u16;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16_lossy(&units)
}

/// Encode a path into the fixed wire slot, failing when it does not
/// fit rather than truncating a device path.
pub fn encode_wide_path(path: &str) -> Result<[u16; MAX_WIDE_PATH]> {
    let mut out = [0u16; MAX_WIDE_PATH];
    let units: Vec<u16> = path.encode_utf16().collect();
    if units.len() >= MAX_WIDE_PATH {
        return Err(ControlError::InvalidPath(path.to_string()));
    }
    out[..units.len()].copy_from_slice(&units);
    Ok(out)
}

// ── mount request ───────────────────────────────────────────────────

/// Wire image of one mount attempt. Built fresh per attempt (retries
/// included); secret fields are wiped by [`submit_mount`] immediately
/// after every submission.
pub struct MountIoc {
    pub return_code: DriverStatus,
    pub drive_slot: i32,
    pub exclusive_access: bool,
    pub cache_password: bool,
    pub use_backup_header: bool,
    pub recovery_mode: bool,
    pub protect_hidden_volume: bool,
    pub read_only: bool,
    pub removable: bool,
    pub preserve_timestamp: bool,
    pub mount_manager: bool,
    pub partition_in_inactive_sysenc_scope: bool,
    pub sysenc_drive_number: i32,
    pub bytes_per_sector: u32,
    pub filesystem_dirty: bool,
    pub password: SecretBlock,
    pub protected_password: SecretBlock,
    pub volume: [u16; MAX_WIDE_PATH],
}

impl MountIoc {
    pub const WIRE_LEN: usize = 60 + SecretBlock::WIRE_LEN * 2 + MAX_WIDE_PATH * 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        put_i32(&mut buf, self.return_code.0);
        put_i32(&mut buf, self.drive_slot);
        put_u32(&mut buf, self.exclusive_access as u32);
        put_u32(&mut buf, self.cache_password as u32);
        put_u32(&mut buf, self.use_backup_header as u32);
        put_u32(&mut buf, self.recovery_mode as u32);
        put_u32(&mut buf, self.protect_hidden_volume as u32);
        put_u32(&mut buf, self.read_only as u32);
        put_u32(&mut buf, self.removable as u32);
        put_u32(&mut buf, self.preserve_timestamp as u32);
        put_u32(&mut buf, self.mount_manager as u32);
        put_u32(&mut buf, self.partition_in_inactive_sysenc_scope as u32);
        put_i32(&mut buf, self.sysenc_drive_number);
        put_u32(&mut buf, self.bytes_per_sector);
        put_u32(&mut buf, self.filesystem_dirty as u32);
        put_secret(&mut buf, &self.password);
        put_secret(&mut buf, &self.protected_password);
        put_wide_path(&mut buf, &self.volume);
        debug_assert_eq!(buf.len(), Self::WIRE_LEN);
        buf
    }

    /// Decode the request side (used by simulated drivers in tests).
    pub fn decode(buf: &[u8]) -> MountIoc {
        let mut password = SecretBlock::empty();
        password.len = u32_at(buf, 60);
        for (i, b) in password.text.iter_mut().enumerate() {
            *b = buf.get(64 + i).copied().unwrap_or(0);
        }
        let mut protected_password = SecretBlock::empty();
        let off = 60 + SecretBlock::WIRE_LEN;
        protected_password.len = u32_at(buf, off);
        for (i, b) in protected_password.text.iter_mut().enumerate() {
            *b = buf.get(off + 4 + i).copied().unwrap_or(0);
        }
        let vol_off = 60 + SecretBlock::WIRE_LEN * 2;
        let mut volume = [0u16; MAX_WIDE_PATH];
        for (i, unit) in volume.iter_mut().enumerate() {
            *unit = u32_at(buf, vol_off + i * 2) as u16;
        }
        MountIoc {
            return_code: DriverStatus(i32_at(buf, 0)),
            drive_slot: i32_at(buf, 4),
            exclusive_access: u32_at(buf, 8) != 0,
            cache_password: u32_at(buf, 12) != 0,
            use_backup_header: u32_at(buf, 16) != 0,
            recovery_mode: u32_at(buf, 20) != 0,
            protect_hidden_volume: u32_at(buf, 24) != 0,
            read_only: u32_at(buf, 28) != 0,
            removable: u32_at(buf, 32) != 0,
            preserve_timestamp: u32_at(buf, 36) != 0,
            mount_manager: u32_at(buf, 40) != 0,
            partition_in_inactive_sysenc_scope: u32_at(buf, 44) != 0,
            sysenc_drive_number: i32_at(buf, 48),
            bytes_per_sector: u32_at(buf, 52),
            filesystem_dirty: u32_at(buf, 56) != 0,
            password,
            protected_password,
            volume,
        }
    }

    pub fn volume_path(&self) -> String {
        let end = self.volume.iter().position(|&u| u == 0).unwrap_or(MAX_WIDE_PATH);
        String::from_utf16_lossy(&self.volume[..end])
    }

    pub fn wipe_secrets(&mut self) {
        self.password.zeroize();
        self.protected_password.zeroize();
    }
}

/// Fields of a completed mount request the transaction inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountReply {
    pub return_code: DriverStatus,
    pub used_backup_header: bool,
    pub filesystem_dirty: bool,
}

impl MountReply {
    fn decode(buf: &[u8]) -> MountReply {
        MountReply {
            return_code: DriverStatus(i32_at(buf, 0)),
            used_backup_header: u32_at(buf, 16) != 0,
            filesystem_dirty: u32_at(buf, 56) != 0,
        }
    }

    /// Encode into a response buffer (simulator side).
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.return_code.0.to_le_bytes());
        buf[16..20].copy_from_slice(&(self.used_backup_header as u32).to_le_bytes());
        buf[56..60].copy_from_slice(&(self.filesystem_dirty as u32).to_le_bytes());
    }
}

/// Submit a mount request and wipe the secret fields of both the
/// request value and the encoded buffer before anything else happens.
/// This holds on every exit path, success or failure.
pub fn submit_mount(
    chan: &dyn DeviceChannel,
    req: &mut MountIoc,
) -> std::result::Result<MountReply, TransportError> {
    let mut buf = req.encode();
    let result = chan.control(codes::MOUNT_VOLUME, &buf, MountIoc::WIRE_LEN);
    buf.zeroize();
    req.wipe_secrets();
    let out = result?;
    Ok(MountReply::decode(&out))
}

// ── dismount ────────────────────────────────────────────────────────

pub struct DismountIoc {
    pub return_code: DriverStatus,
    pub drive_slot: i32,
    pub ignore_open_files: bool,
    pub hidden_protection_triggered: bool,
}

impl DismountIoc {
    pub const WIRE_LEN: usize = 16;

    pub fn decode(buf: &[u8]) -> DismountIoc {
        DismountIoc {
            return_code: DriverStatus(i32_at(buf, 0)),
            drive_slot: i32_at(buf, 4),
            ignore_open_files: u32_at(buf, 8) != 0,
            hidden_protection_triggered: u32_at(buf, 12) != 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        put_i32(&mut buf, self.return_code.0);
        put_i32(&mut buf, self.drive_slot);
        put_u32(&mut buf, self.ignore_open_files as u32);
        put_u32(&mut buf, self.hidden_protection_triggered as u32);
        buf
    }
}

pub struct DismountReply {
    pub return_code: DriverStatus,
    pub hidden_protection_triggered: bool,
}

pub fn submit_dismount(
    chan: &dyn DeviceChannel,
    drive_slot: i32,
    ignore_open_files: bool,
) -> std::result::Result<DismountReply, TransportError> {
    let req = DismountIoc {
        return_code: DriverStatus::SUCCESS,
        drive_slot,
        ignore_open_files,
        hidden_protection_triggered: false,
    };
    let out = chan.control(codes::DISMOUNT_VOLUME, &req.encode(), DismountIoc::WIRE_LEN)?;
    let reply = DismountIoc::decode(&out);
    Ok(DismountReply {
        return_code: reply.return_code,
        hidden_protection_triggered: reply.hidden_protection_triggered,
    })
}

// ── version / status queries ────────────────────────────────────────

pub fn query_version(chan: &dyn DeviceChannel) -> std::result::Result<i32, TransportError> {
    let out = chan.control(codes::GET_DRIVER_VERSION, &[], 4)?;
    Ok(i32_at(&out, 0))
}

pub fn query_version_legacy(chan: &dyn DeviceChannel) -> std::result::Result<i32, TransportError> {
    let out = chan.control(codes::LEGACY_GET_DRIVER_VERSION, &[], 4)?;
    Ok(i32_at(&out, 0))
}

/// Best-effort: the driver only uses this to adjust its own cleanup
/// behavior, so a failed notification is not fatal.
pub fn notify_portable_mode(chan: &dyn DeviceChannel) -> std::result::Result<(), TransportError> {
    chan.control(codes::SET_PORTABLE_MODE_STATUS, &[], 0).map(|_| ())
}

pub fn device_refcount(chan: &dyn DeviceChannel) -> std::result::Result<i32, TransportError> {
    let out = chan.control(codes::GET_DEVICE_REFCOUNT, &[], 4)?;
    Ok(i32_at(&out, 0))
}

pub fn any_volume_mounted(chan: &dyn DeviceChannel) -> std::result::Result<bool, TransportError> {
    let out = chan.control(codes::IS_ANY_VOLUME_MOUNTED, &[], 4)?;
    Ok(i32_at(&out, 0) != 0)
}

/// The driver completes this request only while its password cache is
/// non-empty, so transport failure doubles as the "empty" signal.
pub fn password_cache_empty(chan: &dyn DeviceChannel) -> bool {
    chan.control(codes::GET_PASSWORD_CACHE_STATUS, &[], 0).is_err()
}

// ── mounted-volume list ─────────────────────────────────────────────

pub const MAX_DRIVE_SLOTS: usize = 26;

pub struct MountList {
    pub mounted_mask: u32,
    pub volumes: Vec<String>,
}

pub const MOUNT_LIST_WIRE_LEN: usize = 4 + MAX_DRIVE_SLOTS * MAX_WIDE_PATH * 2;

fn decode_mount_list(buf: &[u8]) -> MountList {
    let mut volumes = Vec::with_capacity(MAX_DRIVE_SLOTS);
    for slot in 0..MAX_DRIVE_SLOTS {
        volumes.push(wide_at(buf, 4 + slot * MAX_WIDE_PATH * 2));
    }
    MountList { mounted_mask: u32_at(buf, 0), volumes }
}

/// Encode a mount list (simulator side).
pub fn encode_mount_list(list: &MountList) -> Vec<u8> {
    let mut buf = vec![0u8; MOUNT_LIST_WIRE_LEN];
    buf[0..4].copy_from_slice(&list.mounted_mask.to_le_bytes());
    for (slot, vol) in list.volumes.iter().enumerate().take(MAX_DRIVE_SLOTS) {
        let off = 4 + slot * MAX_WIDE_PATH * 2;
        for (i, unit) in vol.encode_utf16().take(MAX_WIDE_PATH - 1).enumerate() {
            buf[off + i * 2..off + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    buf
}

pub fn mounted_volumes(chan: &dyn DeviceChannel) -> std::result::Result<MountList, TransportError> {
    let out = chan.control(codes::GET_MOUNTED_VOLUMES, &[], MOUNT_LIST_WIRE_LEN)?;
    Ok(decode_mount_list(&out))
}

pub fn mounted_volumes_legacy(
    chan: &dyn DeviceChannel,
) -> std::result::Result<MountList, TransportError> {
    let out = chan.control(codes::LEGACY_GET_MOUNTED_VOLUMES, &[], MOUNT_LIST_WIRE_LEN)?;
    Ok(decode_mount_list(&out))
}

// ── open test ───────────────────────────────────────────────────────

pub struct OpenTestIoc {
    pub path: [u16; MAX_WIDE_PATH],
    pub detect_filesystem: bool,
    pub detect_bootloader: bool,
    pub filesystem_detected: bool,
    pub bootloader_detected: bool,
}

impl OpenTestIoc {
    pub const WIRE_LEN: usize = MAX_WIDE_PATH * 2 + 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        put_wide_path(&mut buf, &self.path);
        put_u32(&mut buf, self.detect_filesystem as u32);
        put_u32(&mut buf, self.detect_bootloader as u32);
        put_u32(&mut buf, self.filesystem_detected as u32);
        put_u32(&mut buf, self.bootloader_detected as u32);
        buf
    }

    pub fn decode(buf: &[u8]) -> OpenTestIoc {
        let mut path = [0u16; MAX_WIDE_PATH];
        for (i, unit) in path.iter_mut().enumerate() {
            *unit = u32_at(buf, i * 2) as u16;
        }
        let base = MAX_WIDE_PATH * 2;
        OpenTestIoc {
            path,
            detect_filesystem: u32_at(buf, base) != 0,
            detect_bootloader: u32_at(buf, base + 4) != 0,
            filesystem_detected: u32_at(buf, base + 8) != 0,
            bootloader_detected: u32_at(buf, base + 12) != 0,
        }
    }

    pub fn path_string(&self) -> String {
        let end = self.path.iter().position(|&u| u == 0).unwrap_or(MAX_WIDE_PATH);
        String::from_utf16_lossy(&self.path[..end])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenTestReply {
    pub filesystem_detected: bool,
    pub bootloader_detected: bool,
}

/// Probe a device path through the driver. A sharing violation or a
/// not-ready device still counts as "the device exists"; the
/// detection flags are simply unavailable then.
pub fn open_test(
    chan: &dyn DeviceChannel,
    path: &str,
    detect_filesystem: bool,
    detect_bootloader: bool,
) -> Option<OpenTestReply> {
    let wide = encode_wide_path(path).ok()?;
    let req = OpenTestIoc {
        path: wide,
        detect_filesystem,
        detect_bootloader,
        filesystem_detected: false,
        bootloader_detected: false,
    };
    match chan.control(codes::OPEN_TEST, &req.encode(), OpenTestIoc::WIRE_LEN) {
        Ok(out) => {
            let reply = OpenTestIoc::decode(&out);
            Some(OpenTestReply {
                filesystem_detected: reply.filesystem_detected,
                bootloader_detected: reply.bootloader_detected,
            })
        }
        Err(TransportError::SharingViolation) | Err(TransportError::NotReady) => {
            Some(OpenTestReply::default())
        }
        Err(_) => None,
    }
}

// ── drive metadata ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    pub is_dynamic: bool,
    pub bootable: bool,
    pub partition_len: u64,
}

pub const PARTITION_INFO_WIRE_LEN: usize = MAX_WIDE_PATH * 2 + 16;

pub fn partition_info(chan: &dyn DeviceChannel, device: &str) -> Option<PartitionInfo> {
    let wide = encode_wide_path(device).ok()?;
    let mut req = Vec::with_capacity(PARTITION_INFO_WIRE_LEN);
    put_wide_path(&mut req, &wide);
    req.resize(PARTITION_INFO_WIRE_LEN, 0);
    let out = chan
        .control(codes::GET_DRIVE_PARTITION_INFO, &req, PARTITION_INFO_WIRE_LEN)
        .ok()?;
    let base = MAX_WIDE_PATH * 2;
    Some(PartitionInfo {
        is_dynamic: u32_at(&out, base) != 0,
        bootable: u32_at(&out, base + 4) != 0,
        partition_len: u64_at(&out, base + 8),
    })
}

/// Encode a partition-info response (simulator side).
pub fn encode_partition_info(info: &PartitionInfo) -> Vec<u8> {
    let mut buf = vec![0u8; PARTITION_INFO_WIRE_LEN];
    let base = MAX_WIDE_PATH * 2;
    buf[base..base + 4].copy_from_slice(&(info.is_dynamic as u32).to_le_bytes());
    buf[base + 4..base + 8].copy_from_slice(&(info.bootable as u32).to_le_bytes());
    buf[base + 8..base + 16].copy_from_slice(&info.partition_len.to_le_bytes());
    buf
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveGeometry {
    pub removable_media: bool,
    pub bytes_per_sector: u32,
}

pub const GEOMETRY_WIRE_LEN: usize = MAX_WIDE_PATH * 2 + 8;

pub fn drive_geometry(chan: &dyn DeviceChannel, device: &str) -> Option<DriveGeometry> {
    let wide = encode_wide_path(device).ok()?;
    let mut req = Vec::with_capacity(GEOMETRY_WIRE_LEN);
    put_wide_path(&mut req, &wide);
    req.resize(GEOMETRY_WIRE_LEN, 0);
    let out = chan.control(codes::GET_DRIVE_GEOMETRY, &req, GEOMETRY_WIRE_LEN).ok()?;
    let base = MAX_WIDE_PATH * 2;
    Some(DriveGeometry {
        removable_media: u32_at(&out, base) != 0,
        bytes_per_sector: u32_at(&out, base + 4),
    })
}

pub fn encode_drive_geometry(geo: &DriveGeometry) -> Vec<u8> {
    let mut buf = vec![0u8; GEOMETRY_WIRE_LEN];
    let base = MAX_WIDE_PATH * 2;
    buf[base..base + 4].copy_from_slice(&(geo.removable_media as u32).to_le_bytes());
    buf[base + 4..base + 8].copy_from_slice(&geo.bytes_per_sector.to_le_bytes());
    buf
}

pub const SYMLINK_WIRE_LEN: usize = MAX_WIDE_PATH * 4;

/// Resolve an object-namespace symbolic link through the driver
/// (e.g. "\Device\Harddisk0\Partition1" -> "\Device\HarddiskVolume2").
pub fn resolved_symlink(chan: &dyn DeviceChannel, source: &str) -> Option<String> {
    let wide = encode_wide_path(source).ok()?;
    let mut req = Vec::with_capacity(SYMLINK_WIRE_LEN);
    put_wide_path(&mut req, &wide);
    req.resize(SYMLINK_WIRE_LEN, 0);
    let out = chan.control(codes::GET_RESOLVED_SYMLINK, &req, SYMLINK_WIRE_LEN).ok()?;
    let target = wide_at(&out, MAX_WIDE_PATH * 2);
    if target.is_empty() { None } else { Some(target) }
}

/// Encode a symlink response (simulator side).
pub fn encode_resolved_symlink(target: &str) -> Vec<u8> {
    let mut buf = vec![0u8; SYMLINK_WIRE_LEN];
    let off = MAX_WIDE_PATH * 2;
    for (i, unit) in target.encode_utf16().take(MAX_WIDE_PATH - 1).enumerate() {
        buf[off + i * 2..off + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
    buf
}

// ── volume properties ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeProperties {
    pub mode_of_operation: u32,
    pub min_cipher_block_bits: u32,
}

pub const VOLUME_PROPERTIES_WIRE_LEN: usize = 12;

pub fn volume_properties(chan: &dyn DeviceChannel, drive_slot: i32) -> Option<VolumeProperties> {
    let mut req = Vec::with_capacity(VOLUME_PROPERTIES_WIRE_LEN);
    put_i32(&mut req, drive_slot);
    req.resize(VOLUME_PROPERTIES_WIRE_LEN, 0);
    let out = chan
        .control(codes::GET_VOLUME_PROPERTIES, &req, VOLUME_PROPERTIES_WIRE_LEN)
        .ok()?;
    Some(VolumeProperties {
        mode_of_operation: u32_at(&out, 4),
        min_cipher_block_bits: u32_at(&out, 8),
    })
}

pub fn encode_volume_properties(slot: i32, props: &VolumeProperties) -> Vec<u8> {
    let mut buf = vec![0u8; VOLUME_PROPERTIES_WIRE_LEN];
    buf[0..4].copy_from_slice(&slot.to_le_bytes());
    buf[4..8].copy_from_slice(&props.mode_of_operation.to_le_bytes());
    buf[8..12].copy_from_slice(&props.min_cipher_block_bits.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::Password;

    fn sample_request() -> MountIoc {
        let pw = Password::new(b"correct horse").unwrap();
        MountIoc {
            return_code: DriverStatus::SUCCESS,
            drive_slot: 5,
            exclusive_access: true,
            cache_password: false,
            use_backup_header: false,
            recovery_mode: false,
            protect_hidden_volume: false,
            read_only: true,
            removable: false,
            preserve_timestamp: true,
            mount_manager: true,
            partition_in_inactive_sysenc_scope: false,
            sysenc_drive_number: 0,
            bytes_per_sector: 512,
            filesystem_dirty: false,
            password: SecretBlock::from_password(&pw),
            protected_password: SecretBlock::empty(),
            volume: encode_wide_path(r"\Device\Harddisk1\Partition2").unwrap(),
        }
    }

    #[test]
    fn mount_request_survives_the_wire() {
        let req = sample_request();
        let buf = req.encode();
        assert_eq!(buf.len(), MountIoc::WIRE_LEN);
        let back = MountIoc::decode(&buf);
        assert_eq!(back.drive_slot, 5);
        assert!(back.exclusive_access);
        assert!(back.read_only);
        assert_eq!(back.bytes_per_sector, 512);
        assert_eq!(back.password.len, 13);
        assert_eq!(&back.password.text[..13], b"correct horse");
        assert_eq!(back.volume_path(), r"\Device\Harddisk1\Partition2");
    }

    #[test]
    fn paths_too_long_for_the_wire_are_rejected() {
        let long = format!(r"\Device\{}", "x".repeat(MAX_WIDE_PATH));
        assert!(matches!(
            encode_wide_path(&long),
            Err(ControlError::InvalidPath(_))
        ));
    }

    #[test]
    fn request_codes_are_distinct() {
        let all = [
            codes::GET_DRIVER_VERSION,
            codes::LEGACY_GET_DRIVER_VERSION,
            codes::MOUNT_VOLUME,
            codes::DISMOUNT_VOLUME,
            codes::GET_MOUNTED_VOLUMES,
            codes::LEGACY_GET_MOUNTED_VOLUMES,
            codes::IS_ANY_VOLUME_MOUNTED,
            codes::GET_DEVICE_REFCOUNT,
            codes::SET_PORTABLE_MODE_STATUS,
            codes::OPEN_TEST,
            codes::GET_DRIVE_PARTITION_INFO,
            codes::GET_DRIVE_GEOMETRY,
            codes::GET_RESOLVED_SYMLINK,
            codes::GET_PASSWORD_CACHE_STATUS,
            codes::GET_VOLUME_PROPERTIES,
        ];
        let mut sorted = all.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), all.len());
    }

    #[test]
    fn mount_list_round_trip() {
        let list = MountList {
            mounted_mask: 1 << 4,
            volumes: {
                let mut v = vec![String::new(); MAX_DRIVE_SLOTS];
                v[4] = r"\Device\Harddisk0\Partition2".to_string();
                v
            },
        };
        let buf = encode_mount_list(&list);
        assert_eq!(buf.len(), MOUNT_LIST_WIRE_LEN);
        let back = decode_mount_list(&buf);
        assert_eq!(back.mounted_mask, 1 << 4);
        assert_eq!(back.volumes[4], r"\Device\Harddisk0\Partition2");
        assert!(back.volumes[5].is_empty());
    }
}
