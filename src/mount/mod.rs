//! Mount transaction: availability checks, request construction, the
//! submission/retry ladder and the caller-facing orchestration layered
//! on top of it.
//!
//! The retry ladder preserves exact counts and ordering: a bounded
//! mount-on-arrival loop for sharing violations, a single
//! exclusive-to-shared downgrade when the caller allows it, and the
//! backup-header escalation once the consecutive wrong-password count
//! crosses its threshold. Password material is wiped from the wire
//! request immediately after every submission, before any branching
//! on the result.

pub mod extensions;
pub mod unmount;

use std::time::Duration;

use log::{info, warn};

use crate::broadcast;
use crate::devices::{self, SysDevicePathCache, SystemPathKind};
use crate::driver::control::{self, DriverStatus, MountIoc, modes};
use crate::error::{ControlError, ControlWarning, Result};
use crate::os::{
    Clock, DeviceChangeEvent, DeviceChannel, ERROR_FILE_NOT_FOUND, ERROR_NOT_READY, OsVersion,
    SystemEncryptionProbe, SystemEnv, TransportError,
};
use crate::password::{Password, SecretBlock};
use crate::volume;

/// Consecutive wrong-password failures after which the embedded backup
/// header is tried before the error is surfaced.
pub const WRONG_PASSWORD_BACKUP_HEADER_THRESHOLD: u32 = 2;

/// Sharing-violation retry budget while a mount-on-arrival sequence is
/// active, and the pause between attempts.
pub const MOUNT_ON_ARRIVAL_MAX_RETRIES: u32 = 10;
pub const MOUNT_ON_ARRIVAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Target drive letter expressed as a slot index (0 = A:, 25 = Z:).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveSlot(u8);

impl DriveSlot {
    pub fn new(index: u8) -> Result<Self> {
        if index as usize >= control::MAX_DRIVE_SLOTS {
            return Err(ControlError::ParameterIncorrect);
        }
        Ok(DriveSlot(index))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self.0) as char
    }
}

impl std::fmt::Display for DriveSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.letter())
    }
}

/// Per-volume mount options. Copied into each request; the read-only
/// flag may be upgraded (never downgraded) by the host filesystem
/// probe.
#[derive(Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub removable: bool,
    pub preserve_timestamp: bool,
    pub protect_hidden_volume: bool,
    pub protected_password: Option<Password>,
    pub partition_in_inactive_sysenc_scope: bool,
    pub use_backup_header: bool,
    pub recovery_mode: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            read_only: false,
            removable: false,
            preserve_timestamp: true,
            protect_hidden_volume: false,
            protected_password: None,
            partition_in_inactive_sysenc_scope: false,
            use_backup_header: false,
            recovery_mode: false,
        }
    }
}

/// Per-attempt behavior knobs, separate from the volume options.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountFlags {
    pub shared_access: bool,
    pub report_wrong_password: bool,
    pub retry_if_in_use: bool,
    pub cache_password: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Exclusive,
    Shared,
}

/// Outcome of a single mount attempt. `Failed` is recoverable from the
/// caller's point of view (wrong password, driver rejection); hard
/// aborts are `Err` on the transaction itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted { mode: AccessMode, filesystem_dirty: bool },
    Failed(ControlError),
}

/// Borrowed slice of context state a mount transaction runs against.
pub struct MountContext<'a> {
    pub chan: &'a dyn DeviceChannel,
    pub env: &'a dyn SystemEnv,
    pub clock: &'a dyn Clock,
    pub sysenc: &'a dyn SystemEncryptionProbe,
    pub os: OsVersion,
    pub wrong_password_retries: &'a mut u32,
    /// The backup header was already tried for the current interactive
    /// sequence; further wrong passwords surface directly.
    pub backup_header_tried: &'a mut bool,
    pub warnings: &'a mut Vec<ControlWarning>,
    pub sys_paths: &'a mut SysDevicePathCache,
    /// A mount-on-arrival sequence is active; sharing violations get
    /// the bounded retry treatment instead of failing.
    pub mount_on_arrival: bool,
    /// A multi-volume operation is running; not-ready devices are
    /// skipped quietly instead of reported.
    pub bulk_operation: bool,
}

pub fn drive_slot_available(env: &dyn SystemEnv, slot: DriveSlot) -> bool {
    env.logical_drives() & (1 << slot.index()) == 0
}

/// Refuse to mount a partition that sits inside the key scope of the
/// active system encryption: re-mounting it as a plain volume would
/// corrupt it. Forces the slow, reliable system-path discovery.
fn check_sysenc_mount_without_pba(cx: &mut MountContext, device_path: &str) -> Result<()> {
    if device_path.len() < 2 {
        return Err(ControlError::ParameterIncorrect);
    }
    let Some(pos) = device_path.rfind('\\') else {
        return Err(ControlError::NotSysEncPartition);
    };
    if device_path[pos..].eq_ignore_ascii_case(r"\Partition0") {
        // Whole drives are never mountable within a sysenc scope.
        return Err(ControlError::NotSysEncPartition);
    }

    if !cx.sysenc.system_drive_mounted() {
        return Ok(());
    }

    let Some(drive_no) = volume::harddisk_number(device_path) else {
        return Err(ControlError::InvalidPath(device_path.to_string()));
    };
    let parent = format!(r"\Device\Harddisk{drive_no}\Partition0");

    if !cx.sys_paths.is_populated() {
        *cx.sys_paths = devices::discover_sys_device_paths(cx.env, cx.chan, &cx.os);
    }
    match devices::classify_system_path(cx.sys_paths, &parent) {
        Some(SystemPathKind::SystemDrive) => Err(ControlError::MountOnActiveSysEncDrive),
        _ => Ok(()),
    }
}

/// One mount transaction against the driver.
///
/// Returns `Ok(Failed(_))` for outcomes the caller may retry with
/// different credentials, `Err` for everything that aborts the
/// transaction outright.
pub fn mount_volume(
    cx: &mut MountContext,
    slot: DriveSlot,
    volume_path: &str,
    password: Option<&Password>,
    opts: &MountOptions,
    flags: MountFlags,
) -> Result<MountOutcome> {
    if opts.partition_in_inactive_sysenc_scope {
        check_sysenc_mount_without_pba(cx, volume_path)?;
    }
    if volume::is_mounted_volume(cx.env, cx.chan, volume_path) {
        return Err(ControlError::AlreadyMounted);
    }
    if !drive_slot_available(cx.env, slot) {
        return Err(ControlError::DriveLetterUnavailable);
    }
    if password.is_none() && control::password_cache_empty(cx.chan) {
        return Err(ControlError::PasswordNullAndNotCached);
    }

    let (canonical, is_device) = volume::canonical_volume_path(cx.env, cx.chan, volume_path);
    let volume_wide = control::encode_wide_path(&canonical)?;

    // Host filesystem probes only apply to file-backed volumes. The
    // read-only state of the host volume upgrades the request, never
    // downgrades an explicit read-only option.
    let mut read_only = opts.read_only;
    let mut bytes_per_sector = 0u32;
    if !is_device {
        if let Some(root) = cx.env.volume_root(volume::strip_long_path_prefix(volume_path)) {
            if let Some(bps) = cx.env.bytes_per_sector(&root) {
                bytes_per_sector = bps;
            }
            if !read_only {
                read_only = cx.env.volume_read_only(&root).unwrap_or(false);
            }
        }
    }

    let sysenc_drive_number = if opts.partition_in_inactive_sysenc_scope {
        match volume::harddisk_number(&canonical) {
            Some(n) => n,
            None => return Err(ControlError::InvalidPath(canonical)),
        }
    } else {
        0
    };

    let protect_hidden =
        !opts.read_only && opts.protect_hidden_volume && opts.protected_password.is_some();

    let mut exclusive = !flags.shared_access;
    let mut use_backup = opts.use_backup_header;
    let mut arrival_retries = 0u32;
    let mut downgraded = false;

    loop {
        // Fresh request per attempt, secrets included.
        let mut req = MountIoc {
            return_code: DriverStatus::SUCCESS,
            drive_slot: slot.index() as i32,
            exclusive_access: exclusive,
            cache_password: flags.cache_password,
            use_backup_header: use_backup,
            recovery_mode: opts.recovery_mode,
            protect_hidden_volume: protect_hidden,
            read_only,
            removable: opts.removable,
            preserve_timestamp: opts.preserve_timestamp,
            mount_manager: cx.os.mount_manager_usable(),
            partition_in_inactive_sysenc_scope: opts.partition_in_inactive_sysenc_scope,
            sysenc_drive_number,
            bytes_per_sector,
            filesystem_dirty: false,
            password: password.map(SecretBlock::from_password).unwrap_or_else(SecretBlock::empty),
            protected_password: if protect_hidden {
                opts.protected_password
                    .as_ref()
                    .map(SecretBlock::from_password)
                    .unwrap_or_else(SecretBlock::empty)
            } else {
                SecretBlock::empty()
            },
            volume: volume_wide,
        };

        // submit_mount wipes the password fields of request and buffer
        // on every path before this match runs.
        let reply = match control::submit_mount(cx.chan, &mut req) {
            Err(TransportError::SharingViolation) => {
                if cx.mount_on_arrival {
                    arrival_retries += 1;
                    if arrival_retries < MOUNT_ON_ARRIVAL_MAX_RETRIES {
                        cx.clock.sleep(MOUNT_ON_ARRIVAL_RETRY_DELAY);
                        continue;
                    }
                }
                if exclusive && flags.retry_if_in_use && !downgraded {
                    downgraded = true;
                    exclusive = false;
                    continue;
                }
                return Err(ControlError::FileInUse);
            }
            Err(TransportError::NotReady) if cx.bulk_operation => {
                // Expected while sweeping removable slots; skip quietly.
                return Err(ControlError::Os(ERROR_NOT_READY));
            }
            Err(e) => {
                warn!(
                    target: "volgate::mount",
                    "mount transport failure on {slot}: os error {}",
                    e.os_code()
                );
                return Err(ControlError::Os(e.os_code()));
            }
            Ok(reply) => reply,
        };

        if reply.return_code == DriverStatus::WRONG_PASSWORD {
            if flags.report_wrong_password {
                *cx.wrong_password_retries += 1;
                if *cx.wrong_password_retries > WRONG_PASSWORD_BACKUP_HEADER_THRESHOLD
                    && !use_backup
                    && !*cx.backup_header_tried
                {
                    // The primary header may be damaged rather than the
                    // password wrong; retry against the embedded backup
                    // before surfacing anything.
                    info!(
                        target: "volgate::mount",
                        "retrying {slot} with the backup header"
                    );
                    *cx.backup_header_tried = true;
                    use_backup = true;
                    continue;
                }
                if is_device && protect_hidden {
                    // A boot loader on the target drive usually means a
                    // system volume mounted in the wrong mode, not a typo.
                    if let Some(drive_no) = volume::harddisk_number(&canonical) {
                        let probe_path = format!(r"\Device\Harddisk{drive_no}\Partition0");
                        let boot = control::open_test(cx.chan, &probe_path, false, true);
                        if boot.is_some_and(|p| p.bootloader_detected) {
                            return Ok(MountOutcome::Failed(ControlError::PasswordOrModeWrong));
                        }
                    }
                }
            }
            return Ok(MountOutcome::Failed(ControlError::WrongPassword));
        }
        if !reply.return_code.is_success() {
            return Ok(MountOutcome::Failed(ControlError::MountFailed(reply.return_code)));
        }

        // Mounted.
        if reply.used_backup_header && !opts.use_backup_header && flags.report_wrong_password {
            warn!(target: "volgate::mount", "{slot}: primary header damaged, backup used");
            cx.warnings.push(ControlWarning::HeaderDamagedBackupUsed);
        }
        *cx.wrong_password_retries = 0;
        *cx.backup_header_tried = false;
        broadcast::broadcast_device_change(
            cx.env,
            &cx.os,
            DeviceChangeEvent::Arrival,
            slot.index() as u8,
        );
        info!(target: "volgate::mount", "mounted {canonical} at {slot}");
        return Ok(MountOutcome::Mounted {
            mode: if exclusive { AccessMode::Exclusive } else { AccessMode::Shared },
            filesystem_dirty: reply.filesystem_dirty,
        });
    }
}

// ── caller-facing orchestration ─────────────────────────────────────

/// Supplies passwords for the interactive retry loop. Returning `None`
/// means the user aborted.
pub trait CredentialSource {
    fn volume_password(&mut self, volume_path: &str) -> Option<Password>;
}

/// A source with nothing to offer; the cached-password attempt is the
/// only one that can succeed.
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn volume_password(&mut self, _volume_path: &str) -> Option<Password> {
        None
    }
}

/// Yields a password exactly once, then reports abort. Suits callers
/// that collected the password up front.
pub struct FixedCredential {
    password: Option<Password>,
}

impl FixedCredential {
    pub fn new(password: Password) -> Self {
        FixedCredential { password: Some(password) }
    }
}

impl CredentialSource for FixedCredential {
    fn volume_password(&mut self, _volume_path: &str) -> Option<Password> {
        self.password.take()
    }
}

/// Outer-loop knobs for [`mount`].
pub struct MountSession<'a> {
    pub credentials: &'a mut dyn CredentialSource,
    /// Password given on the command line; forces single-shot behavior.
    pub command_line_password: Option<Password>,
    /// No prompting; combined with no command-line password the cached
    /// attempt is the only one made.
    pub silent: bool,
    /// Request shared access up front (mount even if the host file or
    /// device is already in use).
    pub force_shared: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountReport {
    pub mode: AccessMode,
    pub filesystem_dirty: bool,
}

fn advisory_checks(cx: &mut MountContext, slot: DriveSlot, volume_path: &str) {
    if let Some(props) = control::volume_properties(cx.chan, slot.index() as i32) {
        if props.mode_of_operation == modes::CBC || props.mode_of_operation == modes::OUTER_CBC {
            cx.warnings.push(ControlWarning::DeprecatedCipherMode);
        }
        if props.min_cipher_block_bits == 64 {
            cx.warnings.push(ControlWarning::SmallBlockCipher);
        }
    }
    if extensions::has_problematic_extension(volume_path) {
        cx.warnings.push(ControlWarning::ProblematicFileExtension);
    }
}

/// Caller-visible mount entry point: cached passwords first, then the
/// previous multi-volume password, then the interactive loop.
///
/// `previous_password` carries the password across volumes of a bulk
/// operation; it is only read and updated while `bulk` is set.
pub fn mount(
    cx: &mut MountContext,
    slot: DriveSlot,
    volume_path: &str,
    opts: &MountOptions,
    session: &mut MountSession<'_>,
    previous_password: &mut Option<Password>,
    cache_password: bool,
) -> Result<MountReport> {
    if volume_path.is_empty() {
        return Err(ControlError::ParameterIncorrect);
    }
    if volume::is_mounted_volume(cx.env, cx.chan, volume_path) {
        return Err(ControlError::AlreadyMounted);
    }
    if !volume::volume_path_exists(cx.env, cx.chan, volume_path) {
        return Err(ControlError::Os(ERROR_FILE_NOT_FOUND));
    }

    *cx.wrong_password_retries = 0;
    *cx.backup_header_tried = false;

    let base_flags = MountFlags {
        shared_access: session.force_shared,
        report_wrong_password: false,
        retry_if_in_use: true,
        cache_password,
    };

    // 1: cached passwords only.
    let mut outcome = match mount_volume(cx, slot, volume_path, None, opts, base_flags) {
        Ok(outcome) => outcome,
        Err(ControlError::PasswordNullAndNotCached) => {
            MountOutcome::Failed(ControlError::PasswordNullAndNotCached)
        }
        Err(e) => return Err(e),
    };

    // 2: password carried over from the previous volume of a bulk run.
    if matches!(outcome, MountOutcome::Failed(_)) && cx.bulk_operation {
        if let Some(prev) = previous_password.clone() {
            outcome = mount_volume(cx, slot, volume_path, Some(&prev), opts, base_flags)?;
        }
    }

    // 3: interactive loop.
    let mut last_failure = ControlError::WrongPassword;
    loop {
        match outcome {
            MountOutcome::Mounted { mode, filesystem_dirty } => {
                advisory_checks(cx, slot, volume_path);
                return Ok(MountReport { mode, filesystem_dirty });
            }
            MountOutcome::Failed(reason) => last_failure = reason,
        }

        let single_shot = session.command_line_password.is_some() || session.silent;
        let password = if let Some(cmd) = &session.command_line_password {
            cmd.clone()
        } else if !session.silent {
            match session.credentials.volume_password(volume_path) {
                Some(p) => p,
                None => return Err(ControlError::Cancelled),
            }
        } else {
            return Err(last_failure);
        };

        let flags = MountFlags { report_wrong_password: true, ..base_flags };
        outcome = mount_volume(cx, slot, volume_path, Some(&password), opts, flags)?;

        match &outcome {
            MountOutcome::Mounted { .. } => {
                if cx.bulk_operation {
                    *previous_password = Some(password.clone());
                }
                // resolved by the Mounted arm at the top of the loop
            }
            MountOutcome::Failed(reason) if single_shot => return Err(reason.clone()),
            MountOutcome::Failed(_) => {}
        }
        // password drops (and zeroizes) here before the next prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_slots_are_bounded() {
        assert!(DriveSlot::new(0).is_ok());
        assert!(DriveSlot::new(25).is_ok());
        assert_eq!(DriveSlot::new(26).unwrap_err(), ControlError::ParameterIncorrect);
        assert_eq!(DriveSlot::new(4).unwrap().letter(), 'E');
        assert_eq!(DriveSlot::new(4).unwrap().to_string(), "E:");
    }
}
