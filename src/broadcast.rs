//! Device-change notifications to the shell and other processes.
//!
//! Two mechanisms coexist: shell change notifications (which newer
//! shells honor) and the broadcast device-change window message (which
//! older shells require). The choice and the timeout both depend on
//! the OS generation; newer file managers also ignore remove-pending,
//! so it is broadcast as a removal there.

use crate::os::{DeviceChangeEvent, DriveShellEvent, OsVersion, SystemEnv};

const BROADCAST_TIMEOUT_LEGACY_MS: u32 = 1000;
const BROADCAST_TIMEOUT_MODERN_MS: u32 = 100;

/// Announce a drive-level change for `drive_slot` (0 = A:).
pub fn broadcast_device_change(
    env: &dyn SystemEnv,
    os: &OsVersion,
    event: DeviceChangeEvent,
    drive_slot: u8,
) {
    let drive_mask = 1u32 << drive_slot;

    let shell_event = match event {
        DeviceChangeEvent::Arrival => Some(DriveShellEvent::Added),
        DeviceChangeEvent::RemoveComplete => Some(DriveShellEvent::Removed),
        // Newer shells hold handles open while the navigation pane is
        // expanded and ignore remove-pending outright.
        DeviceChangeEvent::RemovePending if os.is_at_least_win7() => {
            Some(DriveShellEvent::Removed)
        }
        DeviceChangeEvent::RemovePending => None,
    };

    if let Some(shell_event) = shell_event {
        for slot in 0..32u8 {
            if drive_mask & (1 << slot) != 0 {
                env.shell_notify_drive(shell_event, slot);
            }
        }
    }

    let timeout = if os.modern_shell_notifications() {
        BROADCAST_TIMEOUT_MODERN_MS
    } else {
        BROADCAST_TIMEOUT_LEGACY_MS
    };
    env.broadcast_device_change(event, drive_mask, timeout);

    // Shells before NT 6 sometimes miss a single arrival broadcast.
    if !os.modern_shell_notifications() && event == DeviceChangeEvent::Arrival {
        env.broadcast_device_change(event, drive_mask, 200);
    }
}

/// Undo an earlier remove-pending announcement after a dismount was
/// abandoned; only needed where remove-pending was already broadcast
/// as a removal.
pub fn undo_remove_pending(env: &dyn SystemEnv, os: &OsVersion, drive_slot: u8) {
    if os.is_at_least_win7() {
        env.shell_notify_drive(DriveShellEvent::Added, drive_slot);
    }
}
