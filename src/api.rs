//! The public control context.
//!
//! `VolumeControl` owns what the original design kept in process-wide
//! globals: the driver connection, the setup gate, the memoized system
//! device paths, the wrong-password counter and the per-slot
//! hidden-volume notification flags. One instance per process is the
//! intended shape; nothing here is synchronized for concurrent use
//! from multiple threads.
//!
//! Every public operation also records its outcome in the structured
//! last-status slot, which is what callers on the C-linkage side read
//! instead of a Rust error value.

use std::path::PathBuf;

use log::info;

use crate::config::ControlOptions;
use crate::devices::{
    self, EnumerateOptions, HostDevice, SysDevicePathCache, SystemPathKind,
};
use crate::driver::{
    self, DriverConnection, INSTALLER_MUTEX_NAME, SETUP_MUTEX_NAME, control,
};
use crate::error::{ControlError, ControlWarning, Result, StatusCode};
use crate::ipc::{self, SetupGate};
use crate::mount::{
    self, DriveSlot, MountContext, MountFlags, MountOptions, MountOutcome, MountReport,
    MountSession,
    unmount::{ForcedUnmountConsent, UnmountContext, unmount_volume},
};
use crate::os::{Host, OsVersion};
use crate::password::Password;

/// Process-wide coordination context for the encrypted-volume driver.
pub struct VolumeControl {
    host: Host,
    options: ControlOptions,
    os: OsVersion,
    gate: SetupGate,
    driver: DriverConnection,
    wrong_password_retries: u32,
    backup_header_tried: bool,
    hidvol_protection_reported: [bool; control::MAX_DRIVE_SLOTS],
    sys_paths: SysDevicePathCache,
    previous_password: Option<Password>,
    warnings: Vec<ControlWarning>,
    last_status: StatusCode,
    mount_on_arrival: bool,
    bulk_operation: bool,
    silent: bool,
}

impl VolumeControl {
    /// Initialize the context against a host. Everything else fails
    /// with `NotInitialized`-class behavior simply by not existing
    /// before this returns.
    pub fn initialize(host: Host, options: ControlOptions) -> Result<Self> {
        let os = host.env.os_version().map_err(ControlError::CantGetOsVersion)?;
        if os.major < 5 {
            return Err(ControlError::UnsupportedOs);
        }
        info!(
            target: "volgate::api",
            "initialized on OS {}.{} sp{}", os.major, os.minor, os.service_pack
        );
        Ok(VolumeControl {
            host,
            options,
            os,
            gate: SetupGate::new(SETUP_MUTEX_NAME),
            driver: DriverConnection::new(),
            wrong_password_retries: 0,
            backup_header_tried: false,
            hidvol_protection_reported: [false; control::MAX_DRIVE_SLOTS],
            sys_paths: SysDevicePathCache::default(),
            previous_password: None,
            warnings: Vec::new(),
            last_status: StatusCode::SUCCESS,
            mount_on_arrival: false,
            bulk_operation: false,
            silent: false,
        })
    }

    // ── boundary plumbing ───────────────────────────────────────────

    /// Run an operation and record its outcome in the last-status
    /// slot: the error's code on failure, the newest warning's code on
    /// success with warnings, success otherwise.
    fn run<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let warn_mark = self.warnings.len();
        let result = op(self);
        self.last_status = match &result {
            Err(e) => e.status(),
            Ok(_) => self
                .warnings
                .get(warn_mark..)
                .and_then(|fresh| fresh.last())
                .map(|w| w.status())
                .unwrap_or(StatusCode::SUCCESS),
        };
        result
    }

    pub fn last_status(&self) -> StatusCode {
        self.last_status
    }

    /// Drain the warnings accumulated since the last drain.
    pub fn take_warnings(&mut self) -> Vec<ControlWarning> {
        std::mem::take(&mut self.warnings)
    }

    // ── session knobs ───────────────────────────────────────────────

    /// Mark the start/end of a multi-volume operation. Ending it wipes
    /// the password carried between volumes.
    pub fn set_bulk_operation(&mut self, active: bool) {
        self.bulk_operation = active;
        if !active {
            self.previous_password = None;
        }
    }

    pub fn set_mount_on_arrival(&mut self, active: bool) {
        self.mount_on_arrival = active;
    }

    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn reset_wrong_password_count(&mut self) {
        self.wrong_password_retries = 0;
        self.backup_header_tried = false;
    }

    pub fn wrong_password_count(&self) -> u32 {
        self.wrong_password_retries
    }

    // ── driver lifecycle ────────────────────────────────────────────

    pub fn is_attached(&self) -> bool {
        self.driver.is_attached()
    }

    pub fn driver_version(&self) -> i32 {
        self.driver.version()
    }

    pub fn portable_mode(&self) -> bool {
        self.driver.portable()
    }

    /// Attach to the driver; loads it transiently first when a driver
    /// path is configured. Returns the verified protocol version.
    pub fn attach(&mut self) -> Result<i32> {
        self.run(|vc| {
            let driver_path: Option<PathBuf> = vc.options.driver_path.clone();
            let mut cx = driver::AttachContext {
                mutexes: vc.host.mutexes.as_ref(),
                devices: vc.host.devices.as_ref(),
                services: vc.host.services.as_ref(),
                env: vc.host.env.as_ref(),
                clock: vc.host.clock.as_ref(),
                gate: &mut vc.gate,
                warnings: &mut vc.warnings,
            };
            driver::attach(
                &mut cx,
                &mut vc.driver,
                driver_path.as_deref(),
                vc.options.system_encryption_active,
            )
        })
    }

    /// Unload the driver and close the connection. Refuses while
    /// volumes are mounted or other processes hold the device.
    pub fn detach(&mut self) -> Result<()> {
        self.run(|vc| {
            driver::unload(vc.host.services.as_ref(), vc.host.clock.as_ref(), &mut vc.driver)
        })
    }

    /// Probe for a concurrently running installer.
    pub fn is_installer_running(&self) -> bool {
        ipc::is_installer_running(self.host.mutexes.as_ref(), INSTALLER_MUTEX_NAME)
    }

    // ── mount / unmount ─────────────────────────────────────────────

    fn mount_context(&mut self) -> Result<MountContext<'_>> {
        Ok(MountContext {
            chan: self.driver.channel()?,
            env: self.host.env.as_ref(),
            clock: self.host.clock.as_ref(),
            sysenc: self.host.sysenc.as_ref(),
            os: self.os,
            wrong_password_retries: &mut self.wrong_password_retries,
            backup_header_tried: &mut self.backup_header_tried,
            warnings: &mut self.warnings,
            sys_paths: &mut self.sys_paths,
            mount_on_arrival: self.mount_on_arrival,
            bulk_operation: self.bulk_operation,
        })
    }

    /// Single mount transaction with explicit credentials and flags.
    pub fn mount_volume(
        &mut self,
        slot: DriveSlot,
        volume_path: &str,
        password: Option<&Password>,
        opts: &MountOptions,
        flags: MountFlags,
    ) -> Result<MountOutcome> {
        self.run(|vc| {
            let mut cx = vc.mount_context()?;
            mount::mount_volume(&mut cx, slot, volume_path, password, opts, flags)
        })
    }

    /// Caller-facing mount: cached passwords, then the previous bulk
    /// password, then the interactive loop against `session`. Uses the
    /// configured mount defaults.
    pub fn mount(
        &mut self,
        slot: DriveSlot,
        volume_path: &str,
        session: &mut MountSession<'_>,
    ) -> Result<MountReport> {
        let opts = self.options.mount_defaults();
        self.mount_with_options(slot, volume_path, &opts, session)
    }

    /// Mount with per-call options instead of the configured defaults.
    pub fn mount_with_options(
        &mut self,
        slot: DriveSlot,
        volume_path: &str,
        opts: &MountOptions,
        session: &mut MountSession<'_>,
    ) -> Result<MountReport> {
        self.run(|vc| {
            let cache_password = vc.options.cache_passwords;
            // split borrows: the context takes the driver/env fields,
            // the carried password travels separately
            let mut cx = MountContext {
                chan: vc.driver.channel()?,
                env: vc.host.env.as_ref(),
                clock: vc.host.clock.as_ref(),
                sysenc: vc.host.sysenc.as_ref(),
                os: vc.os,
                wrong_password_retries: &mut vc.wrong_password_retries,
                backup_header_tried: &mut vc.backup_header_tried,
                warnings: &mut vc.warnings,
                sys_paths: &mut vc.sys_paths,
                mount_on_arrival: vc.mount_on_arrival,
                bulk_operation: vc.bulk_operation,
            };
            let mut previous = vc.previous_password.take();
            let result = mount::mount(
                &mut cx,
                slot,
                volume_path,
                opts,
                session,
                &mut previous,
                cache_password,
            );
            vc.previous_password = previous;
            result
        })
    }

    /// Dismount the volume at `slot`.
    pub fn unmount(
        &mut self,
        slot: DriveSlot,
        forced: bool,
        consent: &dyn ForcedUnmountConsent,
    ) -> Result<()> {
        self.run(|vc| {
            let mut cx = UnmountContext {
                chan: vc.driver.channel()?,
                env: vc.host.env.as_ref(),
                clock: vc.host.clock.as_ref(),
                os: vc.os,
                hidvol_protection_reported: &mut vc.hidvol_protection_reported,
                warnings: &mut vc.warnings,
                silent: vc.silent,
            };
            unmount_volume(&mut cx, slot, forced, consent)
        })
    }

    /// Resolved-path membership check against the driver's list.
    pub fn is_mounted_volume(&mut self, volume_path: &str) -> Result<bool> {
        self.run(|vc| {
            let chan = vc.driver.channel()?;
            Ok(crate::volume::is_mounted_volume(vc.host.env.as_ref(), chan, volume_path))
        })
    }

    // ── device enumeration ──────────────────────────────────────────

    pub fn enumerate_host_devices(&mut self, opts: &EnumerateOptions) -> Result<Vec<HostDevice>> {
        self.run(|vc| {
            let chan = vc.driver.channel()?;
            Ok(devices::enumerate_host_devices(vc.host.env.as_ref(), chan, &vc.os, opts))
        })
    }

    /// One-time system-path discovery; true when both the system
    /// partition and the system drive were found.
    pub fn get_sys_device_paths(&mut self) -> Result<bool> {
        self.run(|vc| {
            if !vc.sys_paths.is_populated() {
                let chan = vc.driver.channel()?;
                vc.sys_paths =
                    devices::discover_sys_device_paths(vc.host.env.as_ref(), chan, &vc.os);
            }
            Ok(vc.sys_paths.is_populated())
        })
    }

    /// Classify a device path against the system paths. `None` means
    /// the answer is indeterminate; pass `reliable_required` to force
    /// the slow discovery scan instead.
    pub fn is_system_device_path(
        &mut self,
        path: &str,
        reliable_required: bool,
    ) -> Result<Option<SystemPathKind>> {
        self.run(|vc| {
            if !vc.sys_paths.is_populated() && reliable_required {
                let chan = vc.driver.channel()?;
                vc.sys_paths =
                    devices::discover_sys_device_paths(vc.host.env.as_ref(), chan, &vc.os);
            }
            Ok(devices::classify_system_path(&vc.sys_paths, path))
        })
    }

    /// Drop the memoized system paths; the next query rescans.
    pub fn invalidate_sys_device_paths(&mut self) {
        self.sys_paths.invalidate();
    }
}
