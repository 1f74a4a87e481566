//! Unmount transaction: bounded retry-on-busy loop, optional forced
//! fallback, and the hidden-volume-protection notification.

use std::time::Duration;

use log::{info, warn};

use crate::broadcast;
use crate::driver::control::{self, DriverStatus};
use crate::error::{ControlError, ControlWarning, Result};
use crate::os::{Clock, DeviceChangeEvent, DeviceChannel, OsVersion, SystemEnv};

use super::DriveSlot;

/// Automatic retries while the driver keeps reporting open files, and
/// the fixed pause between them.
pub const UNMOUNT_MAX_AUTO_RETRIES: u32 = 30;
pub const UNMOUNT_AUTO_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Asked when the automatic retries are exhausted and the dismount was
/// not forced. Returning true repeats the sequence with lock-breaking
/// enabled.
pub trait ForcedUnmountConsent {
    fn retry_forced(&self, slot: DriveSlot) -> bool;
}

/// Never force; open files keep the volume mounted.
pub struct NeverForce;

impl ForcedUnmountConsent for NeverForce {
    fn retry_forced(&self, _slot: DriveSlot) -> bool {
        false
    }
}

pub struct UnmountContext<'a> {
    pub chan: &'a dyn DeviceChannel,
    pub env: &'a dyn SystemEnv,
    pub clock: &'a dyn Clock,
    pub os: OsVersion,
    /// One-shot per drive slot for the whole context lifetime.
    pub hidvol_protection_reported: &'a mut [bool; control::MAX_DRIVE_SLOTS],
    pub warnings: &'a mut Vec<ControlWarning>,
    /// Automated caller; no consent prompt, busy volumes fail with
    /// `UnmountFailed` directly.
    pub silent: bool,
}

/// Single dismount request. Transport failures count as a generic
/// driver failure; the hidden-volume-protection warning is recorded at
/// most once per slot.
fn driver_unmount(cx: &mut UnmountContext, slot: DriveSlot, forced: bool) -> DriverStatus {
    match control::submit_dismount(cx.chan, slot.index() as i32, forced) {
        Err(e) => {
            warn!(
                target: "volgate::unmount",
                "dismount transport failure on {slot}: os error {}",
                e.os_code()
            );
            DriverStatus::OS_ERROR
        }
        Ok(reply) => {
            if reply.return_code.is_success()
                && reply.hidden_protection_triggered
                && !cx.hidvol_protection_reported[slot.index()]
            {
                cx.hidvol_protection_reported[slot.index()] = true;
                cx.warnings.push(ControlWarning::HiddenVolumeProtectionTriggered {
                    slot: slot.index() as u8,
                });
            }
            reply.return_code
        }
    }
}

/// Dismount the volume at `slot`.
pub fn unmount_volume(
    cx: &mut UnmountContext,
    slot: DriveSlot,
    forced: bool,
    consent: &dyn ForcedUnmountConsent,
) -> Result<()> {
    let mut forced = forced;

    loop {
        broadcast::broadcast_device_change(
            cx.env,
            &cx.os,
            DeviceChangeEvent::RemovePending,
            slot.index() as u8,
        );

        let mut retries = UNMOUNT_MAX_AUTO_RETRIES;
        let status = loop {
            let status = driver_unmount(cx, slot, forced);
            if status != DriverStatus::FILES_OPEN {
                break status;
            }
            cx.clock.sleep(UNMOUNT_AUTO_RETRY_DELAY);
            retries -= 1;
            if retries == 0 {
                break DriverStatus::FILES_OPEN;
            }
        };

        if status.is_success() {
            broadcast::broadcast_device_change(
                cx.env,
                &cx.os,
                DeviceChangeEvent::RemoveComplete,
                slot.index() as u8,
            );
            info!(target: "volgate::unmount", "dismounted {slot}");
            return Ok(());
        }

        if status == DriverStatus::FILES_OPEN && !cx.silent {
            if !forced && consent.retry_forced(slot) {
                forced = true;
                continue;
            }
            // The removal was already announced; take it back so the
            // shell does not show a ghost drive.
            broadcast::undo_remove_pending(cx.env, &cx.os, slot.index() as u8);
            return Err(ControlError::FilesOpen);
        }

        return Err(ControlError::UnmountFailed(status));
    }
}
