//! Win32 backends for the OS seams.
//!
//! Thin RAII wrappers over the raw calls; all policy (retry counts,
//! error interpretation, broadcast selection) stays in the portable
//! modules. Constants missing from the generated bindings are defined
//! locally.

#![allow(clippy::upper_case_acronyms)]

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_SERVICE_DOES_NOT_EXIST, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
    MAX_PATH,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, GetDiskFreeSpaceW, GetLogicalDrives,
    GetVolumeInformationW, GetVolumePathNameW, OPEN_EXISTING, QueryDosDeviceW,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Registry::{
    HKEY, HKEY_LOCAL_MACHINE, KEY_READ, REG_DWORD, RegCloseKey, RegOpenKeyExW, RegQueryValueExW,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemDirectoryW, GetVersionExW, OSVERSIONINFOW};
use windows_sys::Win32::System::Threading::{CreateMutexW, OpenMutexW, ReleaseMutex};
use windows_sys::Win32::UI::Shell::SHChangeNotify;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    HWND_BROADCAST, SMTO_ABORTIFHUNG, SendMessageTimeoutW, WM_DEVICECHANGE,
};

use windows_service::service::{
    ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceState as WsState,
    ServiceType,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

use crate::os::{
    DeviceChangeEvent, DeviceChannel, DeviceOpener, DriveShellEvent, ERROR_ACCESS_DENIED, Host,
    MutexCreation, MutexHandle, MutexHost, NoSystemEncryption, OsVersion, ScmError,
    ServiceControl, ServiceState, SystemClock, SystemEnv, TransportError,
};

/*──────────── constants missing from the generated bindings ────────*/

const SHCNE_DRIVEADD: u32 = 0x0000_0100;
const SHCNE_DRIVEREMOVED: u32 = 0x0000_0080;
const SHCNF_PATHW: u32 = 0x0005;

const DBT_DEVICEARRIVAL: usize = 0x8000;
const DBT_DEVICEREMOVEPENDING: usize = 0x8003;
const DBT_DEVICEREMOVECOMPLETE: usize = 0x8004;
const DBT_DEVTYP_VOLUME: u32 = 0x0000_0002;

#[repr(C)]
struct DEV_BROADCAST_VOLUME {
    dbcv_size: u32,
    dbcv_devicetype: u32,
    dbcv_reserved: u32,
    dbcv_unitmask: u32,
    dbcv_flags: u16,
}

const MUTEX_ALL_ACCESS: u32 = 0x001F_0001;

/*──────────── helpers ──────────────────────────────────────────────*/

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&u| u == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

fn last_error() -> u32 {
    unsafe { GetLastError() }
}

/*──────────── named mutexes ────────────────────────────────────────*/

pub struct WinMutexes;

impl MutexHost for WinMutexes {
    fn create_owned(&self, name: &str) -> Result<MutexCreation, u32> {
        let wide = to_wide(name);
        let handle = unsafe { CreateMutexW(ptr::null(), 1, wide.as_ptr()) };
        if handle.is_null() {
            // In multi-user setups the OS answers access-denied when
            // another user (or an elevated owner) holds the mutex.
            return Err(last_error());
        }
        let already_existed = last_error() == super::ERROR_ALREADY_EXISTS;
        Ok(MutexCreation { handle: MutexHandle(handle as u64), already_existed })
    }

    fn release_and_close(&self, handle: MutexHandle) -> bool {
        let raw = handle.0 as HANDLE;
        unsafe { ReleaseMutex(raw) != 0 && CloseHandle(raw) != 0 }
    }

    fn open_existing(&self, name: &str) -> Result<(), u32> {
        let wide = to_wide(name);
        let handle = unsafe { OpenMutexW(MUTEX_ALL_ACCESS, 0, wide.as_ptr()) };
        if handle.is_null() {
            return Err(last_error());
        }
        unsafe { CloseHandle(handle) };
        Ok(())
    }
}

/*──────────── driver device ────────────────────────────────────────*/

/// Owns the device handle; closed on drop.
struct WinChannel {
    handle: HANDLE,
}

unsafe impl Send for WinChannel {}

impl Drop for WinChannel {
    fn drop(&mut self) {
        if self.handle != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

impl DeviceChannel for WinChannel {
    fn control(&self, code: u32, input: &[u8], output_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut out = vec![0u8; output_len];
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                self.handle,
                code,
                if input.is_empty() { ptr::null() } else { input.as_ptr().cast() },
                input.len() as u32,
                if out.is_empty() { ptr::null_mut() } else { out.as_mut_ptr().cast() },
                out.len() as u32,
                &mut returned,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(TransportError::from_os_error(last_error()));
        }
        Ok(out)
    }
}

pub struct WinDevices;

impl DeviceOpener for WinDevices {
    fn open(&self, path: &str) -> Result<Box<dyn DeviceChannel>, u32> {
        let wide = to_wide(path);
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_EXISTING,
                0,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_error());
        }
        Ok(Box::new(WinChannel { handle }))
    }
}

/*──────────── service control manager ──────────────────────────────*/

pub struct WinServices;

fn map_ws_error(e: windows_service::Error) -> ScmError {
    if let windows_service::Error::Winapi(io) = &e {
        match io.raw_os_error().map(|c| c as u32) {
            Some(ERROR_ACCESS_DENIED) => return ScmError::AccessDenied,
            Some(code) if code == ERROR_SERVICE_DOES_NOT_EXIST => return ScmError::NotFound,
            Some(code) => return ScmError::Os(code),
            None => {}
        }
    }
    ScmError::Os(0)
}

fn open_manager() -> Result<ServiceManager, ScmError> {
    ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::ALL_ACCESS)
        .map_err(map_ws_error)
}

fn map_ws_state(state: WsState) -> ServiceState {
    match state {
        WsState::Stopped => ServiceState::Stopped,
        WsState::StartPending => ServiceState::StartPending,
        WsState::StopPending => ServiceState::StopPending,
        _ => ServiceState::Running,
    }
}

impl ServiceControl for WinServices {
    fn connect(&self) -> Result<(), ScmError> {
        open_manager().map(|_| ())
    }

    fn service_exists(&self, name: &str) -> bool {
        let Ok(manager) = open_manager() else {
            return false;
        };
        manager.open_service(name, ServiceAccess::QUERY_STATUS).is_ok()
    }

    fn delete_service(&self, name: &str) -> Result<(), ScmError> {
        let manager = open_manager()?;
        let service = manager
            .open_service(name, ServiceAccess::DELETE)
            .map_err(map_ws_error)?;
        service.delete().map_err(map_ws_error)
    }

    fn create_driver_service(&self, name: &str, binary: &Path) -> Result<(), ScmError> {
        let manager = open_manager()?;
        let info = ServiceInfo {
            name: name.into(),
            display_name: name.into(),
            service_type: ServiceType::KERNEL_DRIVER,
            start_type: ServiceStartType::OnDemand,
            error_control: ServiceErrorControl::Normal,
            executable_path: binary.to_path_buf(),
            launch_arguments: vec![],
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        manager
            .create_service(&info, ServiceAccess::empty())
            .map(|_| ())
            .map_err(map_ws_error)
    }

    fn start_service(&self, name: &str) -> Result<(), ScmError> {
        let manager = open_manager()?;
        let service = manager
            .open_service(name, ServiceAccess::START)
            .map_err(map_ws_error)?;
        service.start::<&OsStr>(&[]).map_err(map_ws_error)
    }

    fn mark_for_delete(&self, name: &str) -> Result<(), ScmError> {
        self.delete_service(name)
    }

    fn query_state(&self, name: &str) -> Result<ServiceState, ScmError> {
        let manager = open_manager()?;
        let service = manager
            .open_service(name, ServiceAccess::QUERY_STATUS)
            .map_err(map_ws_error)?;
        service
            .query_status()
            .map(|status| map_ws_state(status.current_state))
            .map_err(map_ws_error)
    }

    fn stop_service(&self, name: &str) -> Result<ServiceState, ScmError> {
        let manager = open_manager()?;
        let service = manager
            .open_service(name, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS)
            .map_err(map_ws_error)?;
        service
            .stop()
            .map(|status| map_ws_state(status.current_state))
            .map_err(map_ws_error)
    }
}

/*──────────── host environment ─────────────────────────────────────*/

pub struct WinEnv;

impl SystemEnv for WinEnv {
    fn os_version(&self) -> Result<OsVersion, u32> {
        let mut info: OSVERSIONINFOW = unsafe { std::mem::zeroed() };
        info.dwOSVersionInfoSize = std::mem::size_of::<OSVERSIONINFOW>() as u32;
        if unsafe { GetVersionExW(&mut info) } == 0 {
            return Err(last_error());
        }
        // The service pack lives in the CSD string ("Service Pack N").
        let csd = from_wide(&info.szCSDVersion);
        let service_pack = csd
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        Ok(OsVersion {
            major: info.dwMajorVersion,
            minor: info.dwMinorVersion,
            service_pack,
        })
    }

    fn logical_drives(&self) -> u32 {
        unsafe { GetLogicalDrives() }
    }

    fn dos_device_target(&self, name: &str) -> Option<String> {
        let wide = to_wide(name);
        let mut buf = [0u16; MAX_PATH as usize];
        let n = unsafe { QueryDosDeviceW(wide.as_ptr(), buf.as_mut_ptr(), buf.len() as u32) };
        if n == 0 {
            return None;
        }
        Some(from_wide(&buf))
    }

    fn volume_label(&self, drive_no: u8) -> Option<String> {
        let root = to_wide(&format!("{}:\\", (b'A' + drive_no) as char));
        let mut label = [0u16; 64];
        let mut flags = 0u32;
        let ok = unsafe {
            GetVolumeInformationW(
                root.as_ptr(),
                label.as_mut_ptr(),
                label.len() as u32,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut flags,
                ptr::null_mut(),
                0,
            )
        };
        if ok == 0 {
            return None;
        }
        Some(from_wide(&label))
    }

    fn system_drive_letter(&self) -> Option<char> {
        let mut buf = [0u16; MAX_PATH as usize];
        let n = unsafe { GetSystemDirectoryW(buf.as_mut_ptr(), buf.len() as u32) };
        if n == 0 {
            return None;
        }
        from_wide(&buf).chars().next().map(|c| c.to_ascii_uppercase())
    }

    fn volume_root(&self, path: &str) -> Option<String> {
        let wide = to_wide(path);
        let mut buf = [0u16; MAX_PATH as usize];
        let ok = unsafe { GetVolumePathNameW(wide.as_ptr(), buf.as_mut_ptr(), buf.len() as u32) };
        if ok == 0 {
            return None;
        }
        Some(from_wide(&buf))
    }

    fn bytes_per_sector(&self, root: &str) -> Option<u32> {
        let wide = to_wide(root);
        let (mut spc, mut bps, mut free, mut total) = (0u32, 0u32, 0u32, 0u32);
        let ok = unsafe {
            GetDiskFreeSpaceW(wide.as_ptr(), &mut spc, &mut bps, &mut free, &mut total)
        };
        if ok == 0 {
            return None;
        }
        Some(bps)
    }

    fn volume_read_only(&self, root: &str) -> Option<bool> {
        const FILE_READ_ONLY_VOLUME: u32 = 0x0008_0000;
        let wide = to_wide(root);
        let mut flags = 0u32;
        let ok = unsafe {
            GetVolumeInformationW(
                wide.as_ptr(),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut flags,
                ptr::null_mut(),
                0,
            )
        };
        if ok == 0 {
            return None;
        }
        Some(flags & FILE_READ_ONLY_VOLUME != 0)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn machine_dword(&self, subkey: &str, value: &str) -> Option<u32> {
        let sub = to_wide(subkey);
        let val = to_wide(value);
        let mut key: HKEY = ptr::null_mut();
        if unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, sub.as_ptr(), 0, KEY_READ, &mut key) } != 0 {
            return None;
        }
        let mut data = 0u32;
        let mut size = std::mem::size_of::<u32>() as u32;
        let mut kind = 0u32;
        let status = unsafe {
            RegQueryValueExW(
                key,
                val.as_ptr(),
                ptr::null_mut(),
                &mut kind,
                (&mut data as *mut u32).cast(),
                &mut size,
            )
        };
        unsafe { RegCloseKey(key) };
        if status != 0 || kind != REG_DWORD {
            return None;
        }
        Some(data)
    }

    fn shell_notify_drive(&self, event: DriveShellEvent, drive_no: u8) {
        let event_id = match event {
            DriveShellEvent::Added => SHCNE_DRIVEADD,
            DriveShellEvent::Removed => SHCNE_DRIVEREMOVED,
        };
        let root = to_wide(&format!("{}:\\", (b'A' + drive_no) as char));
        unsafe {
            SHChangeNotify(event_id as i32, SHCNF_PATHW, root.as_ptr().cast(), ptr::null());
        }
    }

    fn broadcast_device_change(&self, event: DeviceChangeEvent, drive_mask: u32, timeout_ms: u32) {
        let message = match event {
            DeviceChangeEvent::Arrival => DBT_DEVICEARRIVAL,
            DeviceChangeEvent::RemovePending => DBT_DEVICEREMOVEPENDING,
            DeviceChangeEvent::RemoveComplete => DBT_DEVICEREMOVECOMPLETE,
        };
        let dbv = DEV_BROADCAST_VOLUME {
            dbcv_size: std::mem::size_of::<DEV_BROADCAST_VOLUME>() as u32,
            dbcv_devicetype: DBT_DEVTYP_VOLUME,
            dbcv_reserved: 0,
            dbcv_unitmask: drive_mask,
            dbcv_flags: 0,
        };
        let mut result = 0usize;
        unsafe {
            SendMessageTimeoutW(
                HWND_BROADCAST,
                WM_DEVICECHANGE,
                message,
                (&dbv as *const DEV_BROADCAST_VOLUME) as isize,
                SMTO_ABORTIFHUNG,
                timeout_ms,
                &mut result,
            );
        }
    }
}

/// Host wired to the live OS.
pub fn native_host() -> Host {
    Host {
        mutexes: Box::new(WinMutexes),
        devices: Box::new(WinDevices),
        services: Box::new(WinServices),
        env: Box::new(WinEnv),
        clock: Box::new(SystemClock),
        sysenc: Box::new(NoSystemEncryption),
    }
}
