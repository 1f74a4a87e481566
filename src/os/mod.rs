//! Operating-system seams.
//!
//! Every OS primitive the control plane touches (named mutexes, the
//! driver device, the service control manager, drive tables, shell
//! broadcasts, registry reads, sleeping) sits behind a small trait so
//! the coordination logic can run against the in-memory simulator in
//! tests. The real Windows backends live in [`windows`]; the simulator
//! in [`sim`].

use std::path::Path;
use std::time::Duration;

use crate::error::Result;

pub mod sim;
#[cfg(windows)]
pub mod windows;

// OS error codes the coordination logic branches on. Shared between
// the Windows backend and the simulator.
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_NOT_READY: u32 = 21;
pub const ERROR_SHARING_VIOLATION: u32 = 32;
pub const ERROR_ALREADY_EXISTS: u32 = 183;

/// Registry start-type value marking a boot-start service.
pub const SERVICE_BOOT_START: u32 = 0;

// ── named mutexes ───────────────────────────────────────────────────

/// Opaque token for a held named mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexHandle(pub u64);

/// Result of creating a named mutex in the owned state. When
/// `already_existed` is set the OS handed us a handle to somebody
/// else's mutex; the gate must release and close it immediately.
pub struct MutexCreation {
    pub handle: MutexHandle,
    pub already_existed: bool,
}

pub trait MutexHost {
    /// Create (or open) the named mutex, requesting initial ownership.
    /// `Err` carries the raw OS error of an outright creation failure.
    fn create_owned(&self, name: &str) -> std::result::Result<MutexCreation, u32>;

    /// Release ownership and close the handle. Returns false if the
    /// OS refused either step (the handle is abandoned in that case).
    fn release_and_close(&self, handle: MutexHandle) -> bool;

    /// Open the named mutex without creating it, then close it again.
    /// `Ok(())` means it exists; `Err` carries the raw OS error.
    fn open_existing(&self, name: &str) -> std::result::Result<(), u32>;
}

// ── driver device ───────────────────────────────────────────────────

/// Transport-level failure of a device-control transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    SharingViolation,
    NotReady,
    Os(u32),
}

impl TransportError {
    pub fn from_os_error(code: u32) -> Self {
        match code {
            ERROR_SHARING_VIOLATION => TransportError::SharingViolation,
            ERROR_NOT_READY => TransportError::NotReady,
            other => TransportError::Os(other),
        }
    }

    pub fn os_code(&self) -> u32 {
        match self {
            TransportError::SharingViolation => ERROR_SHARING_VIOLATION,
            TransportError::NotReady => ERROR_NOT_READY,
            TransportError::Os(code) => *code,
        }
    }
}

/// One synchronous request/response transaction against the driver.
/// The channel moves bytes; payload schemas are the caller's problem.
pub trait DeviceChannel {
    fn control(
        &self,
        code: u32,
        input: &[u8],
        output_len: usize,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

pub trait DeviceOpener {
    /// Open the driver device read-only with shared read/write access.
    /// `Err` carries the raw OS error.
    fn open(&self, path: &str) -> std::result::Result<Box<dyn DeviceChannel>, u32>;
}

// ── service control manager ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScmError {
    AccessDenied,
    NotFound,
    Os(u32),
}

pub trait ServiceControl {
    /// Open the service control manager with full access. Maps the
    /// access-denied case separately so the caller can suggest
    /// elevation instead of failing hard.
    fn connect(&self) -> std::result::Result<(), ScmError>;

    fn service_exists(&self, name: &str) -> bool;

    fn delete_service(&self, name: &str) -> std::result::Result<(), ScmError>;

    /// Register a demand-start kernel-driver service for the binary.
    fn create_driver_service(&self, name: &str, binary: &Path) -> std::result::Result<(), ScmError>;

    fn start_service(&self, name: &str) -> std::result::Result<(), ScmError>;

    /// Mark the service for deletion so the OS cleans it up once it
    /// stops. Separate from `delete_service` only in the simulator;
    /// on Windows both are DeleteService.
    fn mark_for_delete(&self, name: &str) -> std::result::Result<(), ScmError>;

    fn query_state(&self, name: &str) -> std::result::Result<ServiceState, ScmError>;

    fn stop_service(&self, name: &str) -> std::result::Result<ServiceState, ScmError>;
}

// ── host environment ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub service_pack: u16,
}

impl OsVersion {
    /// Dynamic volumes get no partition links before NT 6.
    pub fn supports_dynamic_volumes(&self) -> bool {
        self.major >= 6
    }

    /// Newer shells take change notifications; older ones need the
    /// broadcast window message (and an arrival double-send).
    pub fn modern_shell_notifications(&self) -> bool {
        self.major >= 6
    }

    pub fn is_at_least_win7(&self) -> bool {
        self.major > 6 || (self.major == 6 && self.minor >= 1)
    }

    /// The mount manager misbehaves with remounted volumes on NT 5.0.
    pub fn mount_manager_usable(&self) -> bool {
        !(self.major == 5 && self.minor == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveShellEvent {
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChangeEvent {
    Arrival,
    RemovePending,
    RemoveComplete,
}

/// Read-only environment queries plus the two notification sinks.
pub trait SystemEnv {
    fn os_version(&self) -> std::result::Result<OsVersion, u32>;

    /// Bitmap of logical drives currently assigned (bit 0 = A:).
    fn logical_drives(&self) -> u32;

    /// Target of a DOS device name, e.g. "E:" -> "\Device\HarddiskVolume3".
    fn dos_device_target(&self, name: &str) -> Option<String>;

    fn volume_label(&self, drive_no: u8) -> Option<String>;

    fn system_drive_letter(&self) -> Option<char>;

    /// Mount-point root of the volume holding `path` ("C:\").
    fn volume_root(&self, path: &str) -> Option<String>;

    fn bytes_per_sector(&self, root: &str) -> Option<u32>;

    fn volume_read_only(&self, root: &str) -> Option<bool>;

    fn file_exists(&self, path: &Path) -> bool;

    /// DWORD value under HKLM, used for boot-start detection.
    fn machine_dword(&self, subkey: &str, value: &str) -> Option<u32>;

    fn shell_notify_drive(&self, event: DriveShellEvent, drive_no: u8);

    fn broadcast_device_change(&self, event: DeviceChangeEvent, drive_mask: u32, timeout_ms: u32);
}

// ── misc collaborators ──────────────────────────────────────────────

pub trait Clock {
    fn sleep(&self, d: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// External system-encryption collaborator. The control plane only
/// needs to know whether the boot drive is currently mounted through
/// the pre-boot authentication path.
pub trait SystemEncryptionProbe {
    fn system_drive_mounted(&self) -> bool;
}

/// Default probe for hosts with no system encryption configured.
pub struct NoSystemEncryption;

impl SystemEncryptionProbe for NoSystemEncryption {
    fn system_drive_mounted(&self) -> bool {
        false
    }
}

/// Bundle of OS backends the control context runs against.
pub struct Host {
    pub mutexes: Box<dyn MutexHost>,
    pub devices: Box<dyn DeviceOpener>,
    pub services: Box<dyn ServiceControl>,
    pub env: Box<dyn SystemEnv>,
    pub clock: Box<dyn Clock>,
    pub sysenc: Box<dyn SystemEncryptionProbe>,
}

/// Host wired to the real operating system. Fails with
/// `UnsupportedOs` everywhere the Windows backends are absent.
pub fn native_host() -> Result<Host> {
    #[cfg(windows)]
    {
        Ok(windows::native_host())
    }
    #[cfg(not(windows))]
    {
        Err(crate::error::ControlError::UnsupportedOs)
    }
}
