//! Integration tests for the unmount transaction: busy retries,
//! forced fallback, broadcasts and the hidden-volume-protection
//! one-shot.

use volgate::driver::control::codes;
use volgate::mount::unmount::{
    ForcedUnmountConsent, NeverForce, UNMOUNT_AUTO_RETRY_DELAY, UNMOUNT_MAX_AUTO_RETRIES,
};
use volgate::os::DeviceChangeEvent;
use volgate::os::sim::SimWorld;
use volgate::{ControlError, ControlOptions, ControlWarning, DriveSlot, VolumeControl};

struct AlwaysForce;

impl ForcedUnmountConsent for AlwaysForce {
    fn retry_forced(&self, _slot: DriveSlot) -> bool {
        true
    }
}

fn control_with_mounted(sim: &SimWorld, slot: usize) -> VolumeControl {
    sim.with(|s| {
        let canonical = s.add_file_volume(r"D:\vol.vg", b"pw");
        s.kernel.mounted[slot] = Some(canonical);
    });
    let mut control =
        VolumeControl::initialize(sim.host(), ControlOptions::default()).expect("initialize");
    control.attach().expect("attach");
    control
}

fn slot(n: u8) -> DriveSlot {
    DriveSlot::new(n).unwrap()
}

#[test]
fn unmount_broadcasts_and_clears_the_slot() {
    let sim = SimWorld::new();
    let mut control = control_with_mounted(&sim, 5);

    control.unmount(slot(5), false, &NeverForce).expect("unmount");
    sim.with(|s| {
        assert!(s.mounted_at(5).is_none());
        assert!(s.broadcasts.contains(&(DeviceChangeEvent::RemovePending, 1 << 5)));
        assert!(s.broadcasts.contains(&(DeviceChangeEvent::RemoveComplete, 1 << 5)));
    });
}

#[test]
fn busy_volume_is_retried_thirty_times_then_fails() {
    // End-to-end scenario D, automated caller.
    let sim = SimWorld::new();
    let mut control = control_with_mounted(&sim, 5);
    control.set_silent(true);
    sim.with(|s| {
        s.kernel.open_files.insert(5, 1_000);
    });

    let err = control.unmount(slot(5), false, &NeverForce).unwrap_err();
    assert!(matches!(err, ControlError::UnmountFailed(_)));

    sim.with(|s| {
        let dismounts =
            s.kernel.requests.iter().filter(|c| **c == codes::DISMOUNT_VOLUME).count();
        assert_eq!(dismounts, UNMOUNT_MAX_AUTO_RETRIES as usize);
        let waits = s.sleeps.iter().filter(|d| **d == UNMOUNT_AUTO_RETRY_DELAY).count();
        assert_eq!(waits, UNMOUNT_MAX_AUTO_RETRIES as usize);
        assert!(s.mounted_at(5).is_some(), "volume must stay mounted");
    });
}

#[test]
fn busy_volume_succeeds_once_files_close() {
    let sim = SimWorld::new();
    let mut control = control_with_mounted(&sim, 5);
    sim.with(|s| {
        s.kernel.open_files.insert(5, 3);
    });

    control.unmount(slot(5), false, &NeverForce).expect("unmount after retries");
    sim.with(|s| {
        let waits = s.sleeps.iter().filter(|d| **d == UNMOUNT_AUTO_RETRY_DELAY).count();
        assert_eq!(waits, 3);
    });
}

#[test]
fn declined_force_undoes_the_removal_announcement() {
    let sim = SimWorld::new();
    let mut control = control_with_mounted(&sim, 5);
    sim.with(|s| {
        s.kernel.open_files.insert(5, u32::MAX);
    });

    let err = control.unmount(slot(5), false, &NeverForce).unwrap_err();
    assert_eq!(err, ControlError::FilesOpen);
    sim.with(|s| {
        // The shell saw the drive come back.
        assert!(
            s.shell_events
                .contains(&(volgate::os::DriveShellEvent::Added, 5)),
            "expected the remove-pending announcement to be undone"
        );
        assert!(s.mounted_at(5).is_some());
    });
}

#[test]
fn consented_force_breaks_the_locks() {
    let sim = SimWorld::new();
    let mut control = control_with_mounted(&sim, 5);
    sim.with(|s| {
        s.kernel.open_files.insert(5, u32::MAX);
    });

    control.unmount(slot(5), false, &AlwaysForce).expect("forced unmount");
    sim.with(|s| assert!(s.mounted_at(5).is_none()));
}

#[test]
fn hidden_volume_protection_is_reported_once_per_slot() {
    let sim = SimWorld::new();
    let mut control = control_with_mounted(&sim, 5);
    sim.with(|s| {
        s.kernel.hidden_protection_pending.insert(5);
    });

    control.unmount(slot(5), false, &NeverForce).expect("unmount");
    assert!(
        control
            .take_warnings()
            .contains(&ControlWarning::HiddenVolumeProtectionTriggered { slot: 5 })
    );

    // Mount again, trigger protection again: the per-slot notification
    // already fired for this context lifetime.
    sim.with(|s| {
        s.kernel.mounted[5] = Some(r"\??\D:\vol.vg".to_string());
        s.kernel.hidden_protection_pending.insert(5);
    });
    control.unmount(slot(5), false, &NeverForce).expect("second unmount");
    assert!(control.take_warnings().is_empty());
}

#[test]
fn forced_flag_skips_the_busy_loop() {
    let sim = SimWorld::new();
    let mut control = control_with_mounted(&sim, 5);
    sim.with(|s| {
        s.kernel.open_files.insert(5, u32::MAX);
    });

    control.unmount(slot(5), true, &NeverForce).expect("forced unmount");
    sim.with(|s| {
        let dismounts =
            s.kernel.requests.iter().filter(|c| **c == codes::DISMOUNT_VOLUME).count();
        assert_eq!(dismounts, 1);
    });
}
