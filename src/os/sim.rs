//! In-memory host simulator.
//!
//! Direct testing against a live kernel driver is impractical, so the
//! whole OS seam can be backed by this simulator: a scriptable fake
//! kernel answering the control protocol, plus fake mutex, service,
//! and environment tables. The integration tests drive the real
//! coordination logic against it; nothing here talks to a real
//! driver.
//!
//! Key responsibilities:
//! - Serve every control request from `FakeKernel` state.
//! - Simulate the named-mutex create/open races.
//! - Model service lifecycle including delayed deletion and stop.
//! - Record broadcasts, shell notifications and sleeps for asserts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::driver::DRIVER_PROTOCOL_VERSION;
use crate::driver::control::{
    self, DismountIoc, DriveGeometry, DriverStatus, MountIoc, MountList, MountReply,
    OpenTestIoc, PartitionInfo, VolumeProperties, codes,
};
use crate::os::{
    Clock, DeviceChangeEvent, DeviceChannel, DeviceOpener, DriveShellEvent,
    ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, MutexCreation, MutexHandle, MutexHost, OsVersion,
    ScmError, ServiceControl, ServiceState, SystemEncryptionProbe, SystemEnv, TransportError,
};

// ── fake kernel ─────────────────────────────────────────────────────

/// Behavior of one known volume.
#[derive(Debug, Clone)]
pub struct SimVolume {
    pub password: Vec<u8>,
    /// Mounting with the primary header fails even with the right
    /// password.
    pub primary_header_damaged: bool,
    /// The embedded backup header validates.
    pub backup_header_ok: bool,
    /// The driver falls back to the backup on its own and reports it.
    pub auto_backup_fallback: bool,
    /// Remaining submissions answered with a sharing violation.
    pub share_violations: u32,
    /// Sharing violations only hit exclusive requests (a shared
    /// reader exists).
    pub share_violation_exclusive_only: bool,
    /// Remaining submissions answered with not-ready.
    pub not_ready: u32,
    pub filesystem_dirty: bool,
    pub properties: VolumeProperties,
}

impl SimVolume {
    pub fn new(password: &[u8]) -> Self {
        SimVolume {
            password: password.to_vec(),
            primary_header_damaged: false,
            backup_header_ok: true,
            auto_backup_fallback: false,
            share_violations: 0,
            share_violation_exclusive_only: false,
            not_ready: 0,
            filesystem_dirty: false,
            properties: VolumeProperties { mode_of_operation: control::modes::XTS, min_cipher_block_bits: 128 },
        }
    }
}

/// Probe behavior of one device path.
#[derive(Debug, Clone, Default)]
pub struct SimDevice {
    pub openable: bool,
    pub share_violation: bool,
    pub filesystem: bool,
    pub bootloader: bool,
    pub partition: PartitionInfo,
    pub geometry: DriveGeometry,
}

/// Scriptable driver standing behind the device channel.
pub struct FakeKernel {
    pub version: i32,
    /// The primary version request fails; only the legacy one answers.
    pub legacy_version_only: bool,
    /// Both version requests fail.
    pub version_query_fails: bool,
    pub refcount: i32,
    pub portable_notified: bool,
    pub cached_passwords: Vec<Vec<u8>>,
    pub mounted: Vec<Option<String>>,
    pub volumes: HashMap<String, SimVolume>,
    pub devices: HashMap<String, SimDevice>,
    pub symlinks: HashMap<String, String>,
    /// Drive slots whose outer volume got write-protected this session.
    pub hidden_protection_pending: HashSet<usize>,
    /// Busy (files-open) replies remaining per slot.
    pub open_files: HashMap<usize, u32>,
    /// Every request code received, in order.
    pub requests: Vec<u32>,
    /// (use_backup_header, exclusive_access) per mount submission that
    /// reached the driver.
    pub mount_attempts: Vec<(bool, bool)>,
    /// Non-secret fields of the most recent mount request.
    pub last_mount: Option<MountRequestSnapshot>,
}

/// Non-secret view of a decoded mount request, for asserts.
#[derive(Debug, Clone, Copy)]
pub struct MountRequestSnapshot {
    pub drive_slot: i32,
    pub exclusive: bool,
    pub read_only: bool,
    pub removable: bool,
    pub preserve_timestamp: bool,
    pub bytes_per_sector: u32,
    pub use_backup_header: bool,
    pub cache_password: bool,
    pub mount_manager: bool,
    pub password_len: u32,
}

impl Default for FakeKernel {
    fn default() -> Self {
        FakeKernel {
            version: DRIVER_PROTOCOL_VERSION,
            legacy_version_only: false,
            version_query_fails: false,
            refcount: 1,
            portable_notified: false,
            cached_passwords: Vec::new(),
            mounted: vec![None; control::MAX_DRIVE_SLOTS],
            volumes: HashMap::new(),
            devices: HashMap::new(),
            symlinks: HashMap::new(),
            hidden_protection_pending: HashSet::new(),
            open_files: HashMap::new(),
            requests: Vec::new(),
            mount_attempts: Vec::new(),
            last_mount: None,
        }
    }
}

impl FakeKernel {
    fn mount_list(&self) -> MountList {
        let mut mask = 0u32;
        let mut volumes = vec![String::new(); control::MAX_DRIVE_SLOTS];
        for (slot, entry) in self.mounted.iter().enumerate() {
            if let Some(path) = entry {
                mask |= 1 << slot;
                volumes[slot] = path.clone();
            }
        }
        MountList { mounted_mask: mask, volumes }
    }

    fn handle_mount(&mut self, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        let req = MountIoc::decode(input);
        let path = req.volume_path();
        self.last_mount = Some(MountRequestSnapshot {
            drive_slot: req.drive_slot,
            exclusive: req.exclusive_access,
            read_only: req.read_only,
            removable: req.removable,
            preserve_timestamp: req.preserve_timestamp,
            bytes_per_sector: req.bytes_per_sector,
            use_backup_header: req.use_backup_header,
            cache_password: req.cache_password,
            mount_manager: req.mount_manager,
            password_len: req.password.len,
        });

        let reply_with = |status: DriverStatus, used_backup: bool, dirty: bool| {
            let mut out = input.to_vec();
            out.resize(MountIoc::WIRE_LEN, 0);
            MountReply { return_code: status, used_backup_header: used_backup, filesystem_dirty: dirty }
                .write_into(&mut out);
            Ok(out)
        };

        let Some(vol) = self.volumes.get_mut(&path) else {
            return reply_with(DriverStatus::DRIVE_NOT_FOUND, req.use_backup_header, false);
        };

        if vol.not_ready > 0 {
            vol.not_ready -= 1;
            return Err(TransportError::NotReady);
        }
        let violates = vol.share_violations > 0
            && (!vol.share_violation_exclusive_only || req.exclusive_access);
        if violates {
            vol.share_violations -= 1;
            self.mount_attempts.push((req.use_backup_header, req.exclusive_access));
            return Err(TransportError::SharingViolation);
        }

        self.mount_attempts.push((req.use_backup_header, req.exclusive_access));

        let offered_len = (req.password.len as usize).min(req.password.text.len());
        let offered = &req.password.text[..offered_len];
        let password_ok = if req.password.len == 0 {
            self.cached_passwords.iter().any(|c| c == &vol.password)
        } else {
            offered == vol.password.as_slice()
        };

        let header_ok = if req.use_backup_header {
            vol.backup_header_ok
        } else {
            !vol.primary_header_damaged
        };

        let mut used_backup = req.use_backup_header;
        let mut accepted = password_ok && header_ok;
        if password_ok && !header_ok && !req.use_backup_header && vol.auto_backup_fallback {
            accepted = vol.backup_header_ok;
            used_backup = accepted;
        }

        if !accepted {
            return reply_with(DriverStatus::WRONG_PASSWORD, used_backup, false);
        }

        let dirty = vol.filesystem_dirty;
        if req.cache_password && req.password.len != 0 {
            self.cached_passwords.push(offered.to_vec());
        }
        let slot = req.drive_slot as usize;
        if slot < self.mounted.len() {
            self.mounted[slot] = Some(path);
        }
        reply_with(DriverStatus::SUCCESS, used_backup, dirty)
    }

    fn handle_dismount(&mut self, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        let req = DismountIoc::decode(input);
        let slot = req.drive_slot as usize;

        let status = if let Some(remaining) = self.open_files.get_mut(&slot) {
            if *remaining > 0 && !req.ignore_open_files {
                *remaining -= 1;
                DriverStatus::FILES_OPEN
            } else {
                DriverStatus::SUCCESS
            }
        } else {
            DriverStatus::SUCCESS
        };

        let mut triggered = false;
        if status.is_success() {
            if slot < self.mounted.len() {
                self.mounted[slot] = None;
            }
            triggered = self.hidden_protection_pending.remove(&slot);
        }

        let reply = DismountIoc {
            return_code: status,
            drive_slot: req.drive_slot,
            ignore_open_files: req.ignore_open_files,
            hidden_protection_triggered: triggered,
        };
        Ok(reply.encode())
    }

    fn handle(&mut self, code: u32, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.requests.push(code);
        match code {
            codes::GET_DRIVER_VERSION => {
                if self.version_query_fails || self.legacy_version_only {
                    return Err(TransportError::Os(1));
                }
                Ok(self.version.to_le_bytes().to_vec())
            }
            codes::LEGACY_GET_DRIVER_VERSION => {
                if self.version_query_fails {
                    return Err(TransportError::Os(1));
                }
                Ok(self.version.to_le_bytes().to_vec())
            }
            codes::SET_PORTABLE_MODE_STATUS => {
                self.portable_notified = true;
                Ok(Vec::new())
            }
            codes::GET_DEVICE_REFCOUNT => Ok(self.refcount.to_le_bytes().to_vec()),
            codes::IS_ANY_VOLUME_MOUNTED => {
                let any = self.mounted.iter().any(Option::is_some) as i32;
                Ok(any.to_le_bytes().to_vec())
            }
            codes::GET_MOUNTED_VOLUMES | codes::LEGACY_GET_MOUNTED_VOLUMES => {
                Ok(control::encode_mount_list(&self.mount_list()))
            }
            codes::GET_PASSWORD_CACHE_STATUS => {
                if self.cached_passwords.is_empty() {
                    Err(TransportError::Os(ERROR_FILE_NOT_FOUND))
                } else {
                    Ok(Vec::new())
                }
            }
            codes::MOUNT_VOLUME => self.handle_mount(input),
            codes::DISMOUNT_VOLUME => self.handle_dismount(input),
            codes::OPEN_TEST => {
                let req = OpenTestIoc::decode(input);
                let path = req.path_string();
                let Some(device) = self.devices.get(&path) else {
                    return Err(TransportError::Os(ERROR_FILE_NOT_FOUND));
                };
                if device.share_violation {
                    return Err(TransportError::SharingViolation);
                }
                if !device.openable {
                    return Err(TransportError::Os(ERROR_ACCESS_DENIED));
                }
                let reply = OpenTestIoc {
                    filesystem_detected: req.detect_filesystem && device.filesystem,
                    bootloader_detected: req.detect_bootloader && device.bootloader,
                    ..req
                };
                Ok(reply.encode())
            }
            codes::GET_DRIVE_PARTITION_INFO => {
                let req = OpenTestIoc::decode(input); // leading wide path is layout-compatible
                let Some(device) = self.devices.get(&req.path_string()) else {
                    return Err(TransportError::Os(ERROR_FILE_NOT_FOUND));
                };
                Ok(control::encode_partition_info(&device.partition))
            }
            codes::GET_DRIVE_GEOMETRY => {
                let req = OpenTestIoc::decode(input);
                let Some(device) = self.devices.get(&req.path_string()) else {
                    return Err(TransportError::Os(ERROR_FILE_NOT_FOUND));
                };
                Ok(control::encode_drive_geometry(&device.geometry))
            }
            codes::GET_RESOLVED_SYMLINK => {
                let req = OpenTestIoc::decode(input);
                match self.symlinks.get(&req.path_string()) {
                    Some(target) => Ok(control::encode_resolved_symlink(target)),
                    None => Err(TransportError::Os(ERROR_FILE_NOT_FOUND)),
                }
            }
            codes::GET_VOLUME_PROPERTIES => {
                if input.len() < 4 {
                    return Err(TransportError::Os(ERROR_FILE_NOT_FOUND));
                }
                let slot = i32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
                let props = self
                    .mounted
                    .get(slot)
                    .and_then(|entry| entry.as_ref())
                    .and_then(|path| self.volumes.get(path))
                    .map(|vol| vol.properties);
                match props {
                    Some(props) => Ok(control::encode_volume_properties(slot as i32, &props)),
                    None => Err(TransportError::Os(ERROR_FILE_NOT_FOUND)),
                }
            }
            _ => Err(TransportError::Os(ERROR_FILE_NOT_FOUND)),
        }
    }
}

// ── whole-world state ───────────────────────────────────────────────

struct SimMutexEntry {
    owner_handle: u64,
}

struct MutexTableEntry {
    name: String,
    owner: bool,
}

#[derive(Debug, Clone)]
pub struct SimService {
    pub state: ServiceState,
    pub binary: PathBuf,
    pub marked_for_delete: bool,
    /// Stale-deletion countdown: existence polls remaining before the
    /// registration disappears.
    deleting: Option<u32>,
    /// Stop countdown: state polls remaining before Stopped.
    stopping: Option<u32>,
}

pub struct SimState {
    // mutexes
    mutexes: HashMap<String, SimMutexEntry>,
    handles: HashMap<u64, MutexTableEntry>,
    next_handle: u64,
    pub denied_mutexes: HashSet<String>,

    // driver device
    pub driver_present: bool,
    pub device_open_error: u32,
    pub kernel: FakeKernel,

    // services
    pub services: HashMap<String, SimService>,
    pub scm_connect_error: Option<ScmError>,
    pub service_start_error: Option<u32>,
    /// Existence polls a deleted stale service survives.
    pub stale_delete_latency: u32,
    /// State polls a stopping service spends in StopPending.
    pub service_stop_latency: u32,

    // environment
    pub os: OsVersion,
    pub os_version_error: Option<u32>,
    pub logical_drives: u32,
    pub dos_devices: HashMap<String, String>,
    pub volume_labels: HashMap<u8, String>,
    pub system_drive_letter: Option<char>,
    pub volume_roots: HashMap<String, String>,
    pub sector_sizes: HashMap<String, u32>,
    pub read_only_roots: HashSet<String>,
    pub files: HashSet<PathBuf>,
    pub registry: HashMap<(String, String), u32>,
    pub system_drive_mounted: bool,

    // recorded effects
    pub shell_events: Vec<(DriveShellEvent, u8)>,
    pub broadcasts: Vec<(DeviceChangeEvent, u32)>,
    pub sleeps: Vec<Duration>,
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            mutexes: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            denied_mutexes: HashSet::new(),
            driver_present: true,
            device_open_error: ERROR_FILE_NOT_FOUND,
            kernel: FakeKernel::default(),
            services: HashMap::new(),
            scm_connect_error: None,
            service_start_error: None,
            stale_delete_latency: 0,
            service_stop_latency: 0,
            os: OsVersion { major: 6, minor: 1, service_pack: 1 },
            os_version_error: None,
            logical_drives: 1 << 2, // C:
            dos_devices: HashMap::new(),
            volume_labels: HashMap::new(),
            system_drive_letter: Some('C'),
            volume_roots: HashMap::new(),
            sector_sizes: HashMap::new(),
            read_only_roots: HashSet::new(),
            files: HashSet::new(),
            registry: HashMap::new(),
            system_drive_mounted: false,
            shell_events: Vec::new(),
            broadcasts: Vec::new(),
            sleeps: Vec::new(),
        }
    }
}

impl SimState {
    /// Open handles into the named-mutex table.
    pub fn open_mutex_handles(&self) -> usize {
        self.handles.len()
    }

    /// Register a service in the given state, as if a prior run (or an
    /// installer) had created it.
    pub fn register_service(&mut self, name: &str, state: ServiceState) {
        self.services.insert(
            name.to_string(),
            SimService {
                state,
                binary: PathBuf::new(),
                marked_for_delete: false,
                deleting: None,
                stopping: None,
            },
        );
    }

    /// Register a container file plus its volume behavior; returns the
    /// canonical path the driver will see.
    pub fn add_file_volume(&mut self, user_path: &str, password: &[u8]) -> String {
        self.files.insert(PathBuf::from(user_path));
        let canonical = format!(r"\??\{user_path}");
        self.kernel.volumes.insert(canonical.clone(), SimVolume::new(password));
        canonical
    }

    /// Register a raw device plus its volume behavior.
    pub fn add_device_volume(&mut self, device_path: &str, password: &[u8]) -> String {
        self.kernel.devices.insert(
            device_path.to_string(),
            SimDevice { openable: true, ..SimDevice::default() },
        );
        self.kernel.volumes.insert(device_path.to_string(), SimVolume::new(password));
        device_path.to_string()
    }

    pub fn mounted_at(&self, slot: usize) -> Option<&str> {
        self.kernel.mounted.get(slot).and_then(|v| v.as_deref())
    }
}

/// Shared simulator world. Clone handles into as many backends as
/// needed; `host()` wires a complete [`Host`] against it.
#[derive(Clone, Default)]
pub struct SimWorld {
    state: Arc<Mutex<SimState>>,
}

impl SimWorld {
    pub fn new() -> Self {
        SimWorld::default()
    }

    /// Run a closure against the world state.
    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn host(&self) -> crate::os::Host {
        crate::os::Host {
            mutexes: Box::new(SimMutexes { state: self.state.clone() }),
            devices: Box::new(SimDevices { state: self.state.clone() }),
            services: Box::new(SimServices { state: self.state.clone() }),
            env: Box::new(SimEnv { state: self.state.clone() }),
            clock: Box::new(SimClock { state: self.state.clone() }),
            sysenc: Box::new(SimSysEnc { state: self.state.clone() }),
        }
    }

    /// A second mutex backend over the same world, standing in for
    /// another process instance.
    pub fn mutex_host(&self) -> Box<dyn MutexHost> {
        Box::new(SimMutexes { state: self.state.clone() })
    }

    /// A raw channel to the fake kernel, independent of attach.
    pub fn channel(&self) -> Box<dyn DeviceChannel> {
        Box::new(SimChannel { state: self.state.clone() })
    }
}

// ── trait backends ──────────────────────────────────────────────────

struct SimMutexes {
    state: Arc<Mutex<SimState>>,
}

impl MutexHost for SimMutexes {
    fn create_owned(&self, name: &str) -> Result<MutexCreation, u32> {
        let mut st = self.state.lock().unwrap();
        if st.denied_mutexes.contains(name) {
            return Err(ERROR_ACCESS_DENIED);
        }
        let id = st.next_handle;
        st.next_handle += 1;
        if st.mutexes.contains_key(name) {
            st.handles.insert(id, MutexTableEntry { name: name.to_string(), owner: false });
            return Ok(MutexCreation { handle: MutexHandle(id), already_existed: true });
        }
        st.mutexes.insert(name.to_string(), SimMutexEntry { owner_handle: id });
        st.handles.insert(id, MutexTableEntry { name: name.to_string(), owner: true });
        Ok(MutexCreation { handle: MutexHandle(id), already_existed: false })
    }

    fn release_and_close(&self, handle: MutexHandle) -> bool {
        let mut st = self.state.lock().unwrap();
        let Some(entry) = st.handles.remove(&handle.0) else {
            return false;
        };
        if entry.owner {
            let still_owner = st
                .mutexes
                .get(&entry.name)
                .is_some_and(|m| m.owner_handle == handle.0);
            if still_owner {
                st.mutexes.remove(&entry.name);
            }
        }
        true
    }

    fn open_existing(&self, name: &str) -> Result<(), u32> {
        let st = self.state.lock().unwrap();
        if st.denied_mutexes.contains(name) {
            return Err(ERROR_ACCESS_DENIED);
        }
        if st.mutexes.contains_key(name) {
            Ok(())
        } else {
            Err(ERROR_FILE_NOT_FOUND)
        }
    }
}

struct SimChannel {
    state: Arc<Mutex<SimState>>,
}

impl DeviceChannel for SimChannel {
    fn control(&self, code: u32, input: &[u8], output_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut st = self.state.lock().unwrap();
        let mut out = st.kernel.handle(code, input)?;
        out.resize(output_len, 0);
        Ok(out)
    }
}

struct SimDevices {
    state: Arc<Mutex<SimState>>,
}

impl DeviceOpener for SimDevices {
    fn open(&self, _path: &str) -> Result<Box<dyn DeviceChannel>, u32> {
        let st = self.state.lock().unwrap();
        if !st.driver_present {
            return Err(st.device_open_error);
        }
        Ok(Box::new(SimChannel { state: self.state.clone() }))
    }
}

struct SimServices {
    state: Arc<Mutex<SimState>>,
}

impl ServiceControl for SimServices {
    fn connect(&self) -> Result<(), ScmError> {
        match &self.state.lock().unwrap().scm_connect_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn service_exists(&self, name: &str) -> bool {
        let mut st = self.state.lock().unwrap();
        let expired = match st.services.get_mut(name) {
            None => return false,
            Some(svc) => match svc.deleting {
                None => return true,
                Some(0) => true,
                Some(remaining) => {
                    svc.deleting = Some(remaining - 1);
                    false
                }
            },
        };
        if expired {
            st.services.remove(name);
            return false;
        }
        true
    }

    fn delete_service(&self, name: &str) -> Result<(), ScmError> {
        let mut st = self.state.lock().unwrap();
        let latency = st.stale_delete_latency;
        if !st.services.contains_key(name) {
            return Err(ScmError::NotFound);
        }
        if latency > 0 {
            if let Some(svc) = st.services.get_mut(name) {
                svc.deleting = Some(latency);
            }
        } else {
            st.services.remove(name);
        }
        Ok(())
    }

    fn create_driver_service(&self, name: &str, binary: &Path) -> Result<(), ScmError> {
        let mut st = self.state.lock().unwrap();
        if st.services.get(name).is_some_and(|svc| svc.deleting.is_none()) {
            return Err(ScmError::Os(1073)); // ERROR_SERVICE_EXISTS
        }
        st.services.insert(
            name.to_string(),
            SimService {
                state: ServiceState::Stopped,
                binary: binary.to_path_buf(),
                marked_for_delete: false,
                deleting: None,
                stopping: None,
            },
        );
        Ok(())
    }

    fn start_service(&self, name: &str) -> Result<(), ScmError> {
        let mut st = self.state.lock().unwrap();
        if let Some(code) = st.service_start_error {
            return Err(ScmError::Os(code));
        }
        match st.services.get_mut(name) {
            None => Err(ScmError::NotFound),
            Some(svc) => {
                svc.state = ServiceState::Running;
                Ok(())
            }
        }
    }

    fn mark_for_delete(&self, name: &str) -> Result<(), ScmError> {
        let mut st = self.state.lock().unwrap();
        match st.services.get_mut(name) {
            None => Err(ScmError::NotFound),
            Some(svc) => {
                svc.marked_for_delete = true;
                if svc.state == ServiceState::Stopped {
                    st.services.remove(name);
                }
                Ok(())
            }
        }
    }

    fn query_state(&self, name: &str) -> Result<ServiceState, ScmError> {
        let mut st = self.state.lock().unwrap();
        let Some(svc) = st.services.get_mut(name) else {
            return Err(ScmError::NotFound);
        };
        match svc.stopping {
            Some(0) => {
                svc.stopping = None;
                svc.state = ServiceState::Stopped;
            }
            Some(remaining) => {
                svc.stopping = Some(remaining - 1);
                return Ok(ServiceState::StopPending);
            }
            None => {}
        }
        let state = svc.state;
        if state == ServiceState::Stopped && svc.marked_for_delete {
            st.services.remove(name);
        }
        Ok(state)
    }

    fn stop_service(&self, name: &str) -> Result<ServiceState, ScmError> {
        let mut st = self.state.lock().unwrap();
        let latency = st.service_stop_latency;
        match st.services.get_mut(name) {
            None => Err(ScmError::NotFound),
            Some(svc) => {
                if latency > 0 {
                    svc.stopping = Some(latency);
                    svc.state = ServiceState::StopPending;
                    Ok(ServiceState::StopPending)
                } else {
                    svc.state = ServiceState::Stopped;
                    Ok(ServiceState::Stopped)
                }
            }
        }
    }
}

struct SimEnv {
    state: Arc<Mutex<SimState>>,
}

impl SystemEnv for SimEnv {
    fn os_version(&self) -> Result<OsVersion, u32> {
        let st = self.state.lock().unwrap();
        match st.os_version_error {
            Some(code) => Err(code),
            None => Ok(st.os),
        }
    }

    fn logical_drives(&self) -> u32 {
        self.state.lock().unwrap().logical_drives
    }

    fn dos_device_target(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().dos_devices.get(name).cloned()
    }

    fn volume_label(&self, drive_no: u8) -> Option<String> {
        self.state.lock().unwrap().volume_labels.get(&drive_no).cloned()
    }

    fn system_drive_letter(&self) -> Option<char> {
        self.state.lock().unwrap().system_drive_letter
    }

    fn volume_root(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().volume_roots.get(path).cloned()
    }

    fn bytes_per_sector(&self, root: &str) -> Option<u32> {
        self.state.lock().unwrap().sector_sizes.get(root).copied()
    }

    fn volume_read_only(&self, root: &str) -> Option<bool> {
        let st = self.state.lock().unwrap();
        if st.volume_roots.values().any(|r| r == root) || st.sector_sizes.contains_key(root) {
            Some(st.read_only_roots.contains(root))
        } else {
            None
        }
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.state.lock().unwrap().files.contains(path)
    }

    fn machine_dword(&self, subkey: &str, value: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .registry
            .get(&(subkey.to_string(), value.to_string()))
            .copied()
    }

    fn shell_notify_drive(&self, event: DriveShellEvent, drive_no: u8) {
        self.state.lock().unwrap().shell_events.push((event, drive_no));
    }

    fn broadcast_device_change(&self, event: DeviceChangeEvent, drive_mask: u32, _timeout_ms: u32) {
        self.state.lock().unwrap().broadcasts.push((event, drive_mask));
    }
}

struct SimClock {
    state: Arc<Mutex<SimState>>,
}

impl Clock for SimClock {
    fn sleep(&self, d: Duration) {
        self.state.lock().unwrap().sleeps.push(d);
    }
}

struct SimSysEnc {
    state: Arc<Mutex<SimState>>,
}

impl SystemEncryptionProbe for SimSysEnc {
    fn system_drive_mounted(&self) -> bool {
        self.state.lock().unwrap().system_drive_mounted
    }
}
