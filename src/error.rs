//! Error taxonomy and the structured status codes reported at the
//! public boundary.
//!
//! Internally everything is `Result<T, ControlError>`. The numeric,
//! NTSTATUS-shaped `StatusCode` exists only for the process-wide
//! last-error slot kept by [`crate::VolumeControl`], where callers on
//! the C-linkage side of the fence expect a 32-bit code instead of a
//! Rust error value.
//!
//! Key responsibilities:
//! - Define `ControlError` (fatal) and `ControlWarning` (advisory).
//! - Encode both into the severity / facility / code bit layout.
//! - Keep passed-through OS codes and driver codes in their own
//!   facilities so tooling can tell them apart.

use thiserror::Error;

use crate::driver::control::DriverStatus;

pub type Result<T> = std::result::Result<T, ControlError>;

/// Everything that can make a control-plane operation fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    // ── setup / coordination ────────────────────────────────────────
    #[error("another process is setting up the driver")]
    CantAcquireDriver,
    #[error("driver is registered as a boot-start service; portable load refused")]
    DriverAlreadyInstalled,
    #[error("driver binary not found: {0}")]
    DriverNotFound(String),
    #[error("access to the service control manager was denied")]
    NoAccessScm,
    #[error("cannot open the service control manager (os error {0})")]
    CantOpenScm(u32),
    #[error("cannot create the driver service (os error {0})")]
    CantCreateService(u32),
    #[error("cannot start the driver service (os error {0})")]
    CantStartService(u32),
    #[error("driver service did not reach the stopped state")]
    CantStopService,

    // ── protocol ────────────────────────────────────────────────────
    #[error("driver is not installed")]
    DriverNotInstalled,
    #[error("system encryption is configured but the driver is absent")]
    InconsistentDriverState,
    #[error("driver loaded but its device cannot be opened")]
    CantLoadDriver,
    #[error("cannot query the driver protocol version")]
    CantGetDriverVersion,
    #[error("driver protocol version {0:#06x} does not match this build")]
    WrongDriverVersion(i32),
    #[error("driver connection is not attached")]
    NotAttached,

    // ── mount ───────────────────────────────────────────────────────
    #[error("volume is already mounted")]
    AlreadyMounted,
    #[error("requested drive letter is not available")]
    DriveLetterUnavailable,
    #[error("no password given and the driver password cache is empty")]
    PasswordNullAndNotCached,
    #[error("wrong password")]
    WrongPassword,
    #[error("password wrong, or the volume is a system volume mounted in the wrong mode")]
    PasswordOrModeWrong,
    #[error("volume host file or device is in use")]
    FileInUse,
    #[error("driver rejected the mount request ({0})")]
    MountFailed(DriverStatus),
    #[error("volume path is not valid: {0}")]
    InvalidPath(String),
    #[error("only partitions can be mounted within a system encryption scope")]
    NotSysEncPartition,
    #[error("partition belongs to the active system encryption drive")]
    MountOnActiveSysEncDrive,

    // ── unmount ─────────────────────────────────────────────────────
    #[error("files on the volume are still open")]
    FilesOpen,
    #[error("driver rejected the dismount request ({0})")]
    UnmountFailed(DriverStatus),

    // ── teardown refusal ────────────────────────────────────────────
    #[error("volumes are still mounted through this driver")]
    VolumesStillMounted,
    #[error("other processes are still attached to the driver")]
    AppsStillAttached,

    // ── password policy ─────────────────────────────────────────────
    #[error("password and confirmation differ in length")]
    PasswordLengthMismatch,
    #[error("password is too short")]
    PasswordTooShort,
    #[error("password and confirmation do not match")]
    PasswordMismatch,

    // ── environment / surface ───────────────────────────────────────
    #[error("operation cancelled by the user")]
    Cancelled,
    #[error("this operating system is not supported")]
    UnsupportedOs,
    #[error("cannot determine the OS version (os error {0})")]
    CantGetOsVersion(u32),
    #[error("library has not been initialized")]
    NotInitialized,
    #[error("parameter incorrect")]
    ParameterIncorrect,
    #[error("os error {0}")]
    Os(u32),
}

/// Advisory outcomes. The triggering operation still succeeds; the
/// warning stays retrievable until the caller drains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlWarning {
    /// A stale service registration from a crashed run was removed.
    StaleServiceRemoved,
    /// The primary volume header failed and the embedded backup was used.
    HeaderDamagedBackupUsed,
    /// Password accepted but shorter than the recommended minimum.
    WeakPassword,
    /// Volume is encrypted in a deprecated chaining mode.
    DeprecatedCipherMode,
    /// Volume cipher uses 64-bit blocks.
    SmallBlockCipher,
    /// Container file extension is on the OS-protected / AV-scanned list.
    ProblematicFileExtension,
    /// Hidden-volume protection wrote-protected the outer volume during
    /// this session.
    HiddenVolumeProtectionTriggered { slot: u8 },
}

// ── structured status codes ─────────────────────────────────────────

pub const SEVERITY_SUCCESS: u32 = 0x0;
pub const SEVERITY_INFORMATIONAL: u32 = 0x1;
pub const SEVERITY_WARNING: u32 = 0x2;
pub const SEVERITY_ERROR: u32 = 0x3;

/// Facility for volgate's own codes.
pub const FACILITY_CONTROL: u32 = 0x007;
/// Facility for passed-through OS error codes.
pub const FACILITY_OS: u32 = 0x009;
/// Facility for driver (disk subsystem) return codes.
pub const FACILITY_DISK: u32 = 0x00a;

/// 32-bit status in the NTSTATUS layout: bits 31-30 severity, bit 29
/// set (customer bit), bits 28-16 facility, bits 15-0 code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const SUCCESS: StatusCode = make_status(SEVERITY_SUCCESS, FACILITY_CONTROL, 0);

    pub fn severity(self) -> u32 {
        self.0 >> 30
    }

    pub fn facility(self) -> u32 {
        (self.0 >> 16) & 0x1fff
    }

    pub fn code(self) -> u16 {
        self.0 as u16
    }

    pub fn is_success(self) -> bool {
        self.severity() == SEVERITY_SUCCESS
    }
}

pub const fn make_status(severity: u32, facility: u32, code: u16) -> StatusCode {
    StatusCode(severity << 30 | 1 << 29 | facility << 16 | code as u32)
}

impl ControlError {
    /// Ordinal within `FACILITY_CONTROL`. Stable; new kinds append.
    fn ordinal(&self) -> u16 {
        use ControlError::*;
        match self {
            CantAcquireDriver => 1,
            DriverAlreadyInstalled => 2,
            DriverNotFound(_) => 3,
            NoAccessScm => 4,
            CantOpenScm(_) => 5,
            CantCreateService(_) => 6,
            CantStartService(_) => 7,
            CantStopService => 8,
            DriverNotInstalled => 9,
            InconsistentDriverState => 10,
            CantLoadDriver => 11,
            CantGetDriverVersion => 12,
            WrongDriverVersion(_) => 13,
            NotAttached => 14,
            AlreadyMounted => 15,
            DriveLetterUnavailable => 16,
            PasswordNullAndNotCached => 17,
            WrongPassword => 18,
            PasswordOrModeWrong => 19,
            FileInUse => 20,
            MountFailed(_) => 21,
            InvalidPath(_) => 22,
            NotSysEncPartition => 23,
            MountOnActiveSysEncDrive => 24,
            FilesOpen => 25,
            UnmountFailed(_) => 26,
            VolumesStillMounted => 27,
            AppsStillAttached => 28,
            PasswordLengthMismatch => 29,
            PasswordTooShort => 30,
            PasswordMismatch => 31,
            Cancelled => 32,
            UnsupportedOs => 33,
            CantGetOsVersion(_) => 34,
            NotInitialized => 35,
            ParameterIncorrect => 36,
            Os(_) => 0,
        }
    }

    /// Structured code for the last-error slot. OS and driver codes
    /// pass through in their own facilities.
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::Os(code) => make_status(SEVERITY_ERROR, FACILITY_OS, *code as u16),
            ControlError::MountFailed(st) | ControlError::UnmountFailed(st) => {
                make_status(SEVERITY_ERROR, FACILITY_DISK, st.0 as u16)
            }
            other => make_status(SEVERITY_ERROR, FACILITY_CONTROL, other.ordinal()),
        }
    }
}

impl ControlWarning {
    fn ordinal(&self) -> u16 {
        use ControlWarning::*;
        match self {
            StaleServiceRemoved => 1,
            HeaderDamagedBackupUsed => 2,
            WeakPassword => 3,
            DeprecatedCipherMode => 4,
            SmallBlockCipher => 5,
            ProblematicFileExtension => 6,
            HiddenVolumeProtectionTriggered { .. } => 7,
        }
    }

    pub fn status(&self) -> StatusCode {
        make_status(SEVERITY_WARNING, FACILITY_CONTROL, self.ordinal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_layout_matches_ntstatus_shape() {
        let st = ControlError::CantAcquireDriver.status();
        assert_eq!(st.severity(), SEVERITY_ERROR);
        assert_eq!(st.facility(), FACILITY_CONTROL);
        assert_eq!(st.code(), 1);
        // customer bit
        assert_ne!(st.0 & (1 << 29), 0);
    }

    #[test]
    fn os_errors_keep_their_code_in_the_os_facility() {
        let st = ControlError::Os(32).status();
        assert_eq!(st.facility(), FACILITY_OS);
        assert_eq!(st.code(), 32);
    }

    #[test]
    fn driver_rejections_land_in_the_disk_facility() {
        let st = ControlError::MountFailed(DriverStatus::WRONG_PASSWORD).status();
        assert_eq!(st.facility(), FACILITY_DISK);
        assert_eq!(st.code(), DriverStatus::WRONG_PASSWORD.0 as u16);
    }

    #[test]
    fn warnings_carry_warning_severity() {
        assert_eq!(ControlWarning::WeakPassword.status().severity(), SEVERITY_WARNING);
        assert!(!ControlWarning::WeakPassword.status().is_success());
        assert!(StatusCode::SUCCESS.is_success());
    }
}
