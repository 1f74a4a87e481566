//! Driver connection manager.
//!
//! Owns the attach state machine (`Detached -> Attaching ->
//! Attached`), the transient service load used in portable mode, and
//! the guarded unload. The setup gate only covers the open-or-install
//! decision window, not the whole session; it is released right after
//! the device open (installed mode) or the service load (portable
//! mode) completes, whichever way it went.

pub mod control;

use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{ControlError, ControlWarning, Result};
use crate::ipc::SetupGate;
use crate::os::{
    Clock, DeviceChannel, DeviceOpener, MutexHost, SERVICE_BOOT_START, ScmError, ServiceControl,
    ServiceState, SystemEnv,
};

/// Kernel service identity and the user-mode device path it exposes.
pub const DRIVER_SERVICE_NAME: &str = "volgate";
pub const DRIVER_DEVICE_PATH: &str = r"\\.\VolGate";
pub const DRIVER_SERVICE_KEY: &str = r"SYSTEM\CurrentControlSet\Services\volgate";

/// Setup serialization mutex names (driver setup, installer).
pub const SETUP_MUTEX_NAME: &str = r"Global\VolGate Driver Setup";
pub const INSTALLER_MUTEX_NAME: &str = r"Global\VolGate Setup";

/// Protocol version this build speaks. The driver must match exactly.
pub const DRIVER_PROTOCOL_VERSION: i32 = 0x0701;

/// Stale-service cleanup polls for service absence instead of trusting
/// a fixed sleep; the registration is gone long before the budget runs
/// out on a healthy service manager.
pub const STALE_SERVICE_POLLS: u32 = 10;
pub const STALE_SERVICE_POLL_DELAY: Duration = Duration::from_millis(100);

/// Service-stop wait during unload.
pub const UNLOAD_STOP_POLLS: u32 = 10;
pub const UNLOAD_STOP_DELAY: Duration = Duration::from_millis(200);

fn scm_code(e: &ScmError) -> u32 {
    match e {
        ScmError::AccessDenied => crate::os::ERROR_ACCESS_DENIED,
        ScmError::NotFound => 1060, // ERROR_SERVICE_DOES_NOT_EXIST
        ScmError::Os(code) => *code,
    }
}

/// The process's connection to the driver device. One per context;
/// other processes open their own handles to the same device object.
pub struct DriverConnection {
    channel: Option<Box<dyn DeviceChannel>>,
    version: i32,
    portable: bool,
    /// Version query failed: the handle is intentionally kept open for
    /// diagnostics but refuses further use until detach.
    degraded: bool,
}

impl Default for DriverConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverConnection {
    pub fn new() -> Self {
        DriverConnection { channel: None, version: 0, portable: false, degraded: false }
    }

    pub fn is_attached(&self) -> bool {
        self.channel.is_some() && !self.degraded
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn portable(&self) -> bool {
        self.portable
    }

    /// The control channel, if attached and usable.
    pub fn channel(&self) -> Result<&dyn DeviceChannel> {
        match &self.channel {
            Some(chan) if !self.degraded => Ok(chan.as_ref()),
            _ => Err(ControlError::NotAttached),
        }
    }

    pub fn close(&mut self) {
        self.channel = None;
        self.version = 0;
        self.portable = false;
        self.degraded = false;
    }
}

/// Borrowed context for the attach sequence.
pub struct AttachContext<'a> {
    pub mutexes: &'a dyn MutexHost,
    pub devices: &'a dyn DeviceOpener,
    pub services: &'a dyn ServiceControl,
    pub env: &'a dyn SystemEnv,
    pub clock: &'a dyn Clock,
    pub gate: &'a mut SetupGate,
    pub warnings: &'a mut Vec<ControlWarning>,
}

/// Attach to the driver, loading it as a transient service first when
/// an explicit driver path is configured (portable mode). Returns the
/// verified protocol version.
pub fn attach(
    cx: &mut AttachContext<'_>,
    conn: &mut DriverConnection,
    driver_path: Option<&Path>,
    system_encryption_active: bool,
) -> Result<i32> {
    if conn.is_attached() {
        return Ok(conn.version);
    }

    if !cx.gate.acquire_with_retries(cx.mutexes, cx.clock) {
        return Err(ControlError::CantAcquireDriver);
    }

    let channel: Box<dyn DeviceChannel> = match driver_path {
        None => {
            // Installed mode: the driver is either there or it is not;
            // this component never self-installs.
            let opened = cx.devices.open(DRIVER_DEVICE_PATH);
            cx.gate.release(cx.mutexes);
            match opened {
                Ok(chan) => chan,
                Err(code) => {
                    debug!(
                        target: "volgate::driver",
                        "device open failed with os error {code}"
                    );
                    return Err(if system_encryption_active {
                        // Config says the system is encrypted but no
                        // driver answers: someone has to sort that out
                        // before we touch anything.
                        ControlError::InconsistentDriverState
                    } else {
                        ControlError::DriverNotInstalled
                    });
                }
            }
        }
        Some(path) => {
            let loaded = load_driver(cx, path);
            cx.gate.release(cx.mutexes);
            loaded?;
            let chan = cx
                .devices
                .open(DRIVER_DEVICE_PATH)
                .map_err(|_| ControlError::CantLoadDriver)?;
            conn.portable = true;
            if control::notify_portable_mode(chan.as_ref()).is_err() {
                // Best effort; the driver only uses this for cleanup.
                debug!(target: "volgate::driver", "portable-mode notification failed");
            }
            chan
        }
    };

    let version = match control::query_version(channel.as_ref()) {
        Ok(v) => v,
        Err(_) => match control::query_version_legacy(channel.as_ref()) {
            Ok(v) => v,
            Err(_) => {
                // Deliberately keep the handle open so the state can
                // be inspected; it refuses all use until detach.
                conn.channel = Some(channel);
                conn.degraded = true;
                warn!(
                    target: "volgate::driver",
                    "version query failed; handle kept open but unusable"
                );
                return Err(ControlError::CantGetDriverVersion);
            }
        },
    };

    if version != DRIVER_PROTOCOL_VERSION {
        conn.channel = Some(channel);
        conn.version = version;
        conn.degraded = false;
        // Tear the mismatched driver down before reporting; refusals
        // (volumes mounted elsewhere) still end with a closed handle
        // and a clean detached state.
        if let Err(e) = unload(cx.services, cx.clock, conn) {
            debug!(target: "volgate::driver", "mismatch teardown refused: {e}");
        }
        conn.close();
        return Err(ControlError::WrongDriverVersion(version));
    }

    conn.channel = Some(channel);
    conn.version = version;
    conn.degraded = false;
    info!(
        target: "volgate::driver",
        "attached, protocol version {version:#06x}{}",
        if conn.portable { " (portable)" } else { "" }
    );
    Ok(version)
}

/// Register and start the driver as a demand-start kernel service,
/// marking it for deletion so it disappears once stopped.
pub fn load_driver(cx: &mut AttachContext<'_>, path: &Path) -> Result<()> {
    if cx.env.machine_dword(DRIVER_SERVICE_KEY, "Start") == Some(SERVICE_BOOT_START) {
        // A permanent install exists; loading a second copy portable
        // would fight it over the device name.
        return Err(ControlError::DriverAlreadyInstalled);
    }

    if !cx.env.file_exists(path) {
        return Err(ControlError::DriverNotFound(path.display().to_string()));
    }

    match cx.services.connect() {
        Ok(()) => {}
        Err(ScmError::AccessDenied) => return Err(ControlError::NoAccessScm),
        Err(e) => return Err(ControlError::CantOpenScm(scm_code(&e))),
    }

    if cx.services.service_exists(DRIVER_SERVICE_NAME) {
        // Leftover from a crashed prior run.
        warn!(target: "volgate::driver", "removing stale service registration");
        cx.warnings.push(ControlWarning::StaleServiceRemoved);
        let _ = cx.services.delete_service(DRIVER_SERVICE_NAME);
        for _ in 0..STALE_SERVICE_POLLS {
            if !cx.services.service_exists(DRIVER_SERVICE_NAME) {
                break;
            }
            cx.clock.sleep(STALE_SERVICE_POLL_DELAY);
        }
    }

    cx.services
        .create_driver_service(DRIVER_SERVICE_NAME, path)
        .map_err(|e| ControlError::CantCreateService(scm_code(&e)))?;

    let started = cx.services.start_service(DRIVER_SERVICE_NAME);
    // Mark for deletion regardless of the start outcome so the OS
    // cleans the registration up when the service stops.
    let _ = cx.services.mark_for_delete(DRIVER_SERVICE_NAME);

    started.map_err(|e| ControlError::CantStartService(scm_code(&e)))?;
    info!(target: "volgate::driver", "driver service started from {}", path.display());
    Ok(())
}

/// Unload the driver: refuse while volumes are mounted or other
/// processes hold the device, otherwise close the handle and stop the
/// service if one is registered.
pub fn unload(
    services: &dyn ServiceControl,
    clock: &dyn Clock,
    conn: &mut DriverConnection,
) -> Result<()> {
    let Some(chan) = conn.channel.as_deref() else {
        return Ok(());
    };

    // Mounted-volume check comes first; the refcount answer is
    // meaningless while anything is mounted.
    let mounted = match control::any_volume_mounted(chan) {
        Ok(any) => Some(any),
        Err(_) => match control::mounted_volumes_legacy(chan) {
            Ok(list) => Some(list.mounted_mask != 0),
            Err(_) => None,
        },
    };
    match mounted {
        Some(true) => return Err(ControlError::VolumesStillMounted),
        Some(false) => {}
        None => {
            // Both queries failed: the driver is likely gone already,
            // nothing left to unload.
            conn.close();
            return Ok(());
        }
    }

    let refcount = control::device_refcount(chan).unwrap_or(-1);
    if refcount > 1 {
        return Err(ControlError::AppsStillAttached);
    }

    conn.close();

    if !services.service_exists(DRIVER_SERVICE_NAME) {
        return Ok(());
    }
    match services.query_state(DRIVER_SERVICE_NAME) {
        Ok(ServiceState::Stopped) => return Ok(()),
        Ok(_) => {}
        Err(ScmError::NotFound) => return Ok(()),
        Err(ScmError::AccessDenied) => return Err(ControlError::NoAccessScm),
        Err(e) => return Err(ControlError::CantOpenScm(scm_code(&e))),
    }

    let _ = services.stop_service(DRIVER_SERVICE_NAME);
    for _ in 0..UNLOAD_STOP_POLLS {
        match services.query_state(DRIVER_SERVICE_NAME) {
            Ok(ServiceState::Stopped) => return Ok(()),
            // Marked-for-delete registrations vanish on stop.
            Err(ScmError::NotFound) => return Ok(()),
            _ => clock.sleep(UNLOAD_STOP_DELAY),
        }
    }
    Err(ControlError::CantStopService)
}
