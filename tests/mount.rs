//! Integration tests for the mount transaction and its retry ladder,
//! against the simulated kernel.
//!
//! Key responsibilities:
//! - Cover the end-to-end mount scenarios (cached, interactive, bulk).
//! - Verify the password-wipe invariant on every outcome.
//! - Verify wrong-password counting and backup-header escalation.
//! - Verify sharing-violation handling and the shared downgrade.

use std::time::Duration;

use volgate::driver::control::{
    self, DriverStatus, MountIoc, codes, encode_wide_path, submit_mount,
};
use volgate::mount::{MOUNT_ON_ARRIVAL_MAX_RETRIES, MountFlags, MountOptions, MountOutcome};
use volgate::os::DeviceChangeEvent;
use volgate::os::sim::SimWorld;
use volgate::password::SecretBlock;
use volgate::{
    AccessMode, ControlError, ControlOptions, ControlWarning, CredentialSource, DriveSlot,
    FixedCredential, MountSession, Password, VolumeControl,
};

fn control_for(sim: &SimWorld) -> VolumeControl {
    let mut control =
        VolumeControl::initialize(sim.host(), ControlOptions::default()).expect("initialize");
    control.attach().expect("attach");
    control
}

fn slot(n: u8) -> DriveSlot {
    DriveSlot::new(n).unwrap()
}

fn pw(bytes: &[u8]) -> Password {
    Password::new(bytes).unwrap()
}

fn report_flags() -> MountFlags {
    MountFlags { report_wrong_password: true, retry_if_in_use: true, ..MountFlags::default() }
}

/// Passwords handed out in order; abort when exhausted.
struct VecCredential(Vec<Password>);

impl CredentialSource for VecCredential {
    fn volume_password(&mut self, _volume_path: &str) -> Option<Password> {
        if self.0.is_empty() { None } else { Some(self.0.remove(0)) }
    }
}

#[test]
fn mount_scenario_with_correct_password() {
    // End-to-end scenario B: free slot, volume not mounted yet.
    let sim = SimWorld::new();
    let canonical = sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"correct"));
    let mut control = control_for(&sim);

    let mut creds = FixedCredential::new(pw(b"correct"));
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    let report = control.mount(slot(5), r"D:\vol.vg", &mut session).expect("mount");

    assert_eq!(report.mode, AccessMode::Exclusive);
    assert_eq!(control.wrong_password_count(), 0);
    sim.with(|s| {
        assert_eq!(s.mounted_at(5), Some(canonical.as_str()));
        assert!(s.broadcasts.contains(&(DeviceChangeEvent::Arrival, 1 << 5)));
    });
}

#[test]
fn remounting_the_same_volume_is_refused_before_the_driver() {
    // End-to-end scenario C.
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"correct"));
    let mut control = control_for(&sim);

    let mut creds = FixedCredential::new(pw(b"correct"));
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    control.mount(slot(5), r"D:\vol.vg", &mut session).expect("first mount");
    let mount_requests_after_first =
        sim.with(|s| s.kernel.requests.iter().filter(|c| **c == codes::MOUNT_VOLUME).count());

    let mut creds = FixedCredential::new(pw(b"correct"));
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    assert_eq!(
        control.mount(slot(6), r"D:\vol.vg", &mut session).unwrap_err(),
        ControlError::AlreadyMounted
    );
    // No further mount request reached the driver.
    let mount_requests_after_second =
        sim.with(|s| s.kernel.requests.iter().filter(|c| **c == codes::MOUNT_VOLUME).count());
    assert_eq!(mount_requests_after_first, mount_requests_after_second);
}

#[test]
fn password_fields_are_wiped_after_every_submission() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"D:\ok.vg", b"correct");
        s.add_file_volume(r"D:\busy.vg", b"correct");
        if let Some(vol) = s.kernel.volumes.get_mut(r"\??\D:\busy.vg") {
            vol.share_violations = 100;
        }
    });
    let chan = sim.channel();

    let build = |volume: &str| MountIoc {
        return_code: DriverStatus::SUCCESS,
        drive_slot: 7,
        exclusive_access: true,
        cache_password: false,
        use_backup_header: false,
        recovery_mode: false,
        protect_hidden_volume: false,
        read_only: false,
        removable: false,
        preserve_timestamp: true,
        mount_manager: true,
        partition_in_inactive_sysenc_scope: false,
        sysenc_drive_number: 0,
        bytes_per_sector: 512,
        filesystem_dirty: false,
        password: SecretBlock::from_password(&pw(b"correct")),
        protected_password: SecretBlock::from_password(&pw(b"hidden-secret")),
        volume: encode_wide_path(volume).unwrap(),
    };

    // Success.
    let mut req = build(r"\??\D:\ok.vg");
    assert!(submit_mount(chan.as_ref(), &mut req).unwrap().return_code.is_success());
    assert!(req.password.is_wiped() && req.protected_password.is_wiped());

    // Wrong password (driver-level rejection).
    let mut req = build(r"\??\D:\ok.vg");
    req.password = SecretBlock::from_password(&pw(b"wrong"));
    let reply = submit_mount(chan.as_ref(), &mut req).unwrap();
    assert_eq!(reply.return_code, DriverStatus::WRONG_PASSWORD);
    assert!(req.password.is_wiped() && req.protected_password.is_wiped());

    // Transport failure (sharing violation).
    let mut req = build(r"\??\D:\busy.vg");
    assert!(submit_mount(chan.as_ref(), &mut req).is_err());
    assert!(req.password.is_wiped() && req.protected_password.is_wiped());

    // Unknown volume (driver error code).
    let mut req = build(r"\??\D:\absent.vg");
    let reply = submit_mount(chan.as_ref(), &mut req).unwrap();
    assert_eq!(reply.return_code, DriverStatus::DRIVE_NOT_FOUND);
    assert!(req.password.is_wiped() && req.protected_password.is_wiped());
}

#[test]
fn third_wrong_password_triggers_the_backup_header_retry() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"right"));
    let mut control = control_for(&sim);
    let wrong = pw(b"wrong");
    let opts = MountOptions::default();

    // Attempts 1 and 2: plain wrong-password failures.
    for expected in 1..=2u32 {
        let outcome = control
            .mount_volume(slot(5), r"D:\vol.vg", Some(&wrong), &opts, report_flags())
            .unwrap();
        assert_eq!(outcome, MountOutcome::Failed(ControlError::WrongPassword));
        assert_eq!(control.wrong_password_count(), expected);
    }
    assert_eq!(sim.with(|s| s.kernel.mount_attempts.len()), 2);

    // Attempt 3 crosses the threshold: the backup header is tried
    // automatically before the error surfaces.
    let outcome = control
        .mount_volume(slot(5), r"D:\vol.vg", Some(&wrong), &opts, report_flags())
        .unwrap();
    assert_eq!(outcome, MountOutcome::Failed(ControlError::WrongPassword));
    let attempts = sim.with(|s| s.kernel.mount_attempts.clone());
    assert_eq!(attempts.len(), 4);
    assert_eq!(attempts[2], (false, true));
    assert_eq!(attempts[3], (true, true), "third attempt must escalate to the backup header");

    // Attempt 4: backup already tried, surface directly.
    let outcome = control
        .mount_volume(slot(5), r"D:\vol.vg", Some(&wrong), &opts, report_flags())
        .unwrap();
    assert_eq!(outcome, MountOutcome::Failed(ControlError::WrongPassword));
    let attempts = sim.with(|s| s.kernel.mount_attempts.clone());
    assert_eq!(attempts.len(), 5);
    assert_eq!(attempts[4], (false, true));
}

#[test]
fn damaged_primary_header_recovers_through_the_backup() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"D:\vol.vg", b"right");
        let vol = s.kernel.volumes.get_mut(r"\??\D:\vol.vg").unwrap();
        vol.primary_header_damaged = true;
    });
    let mut control = control_for(&sim);
    let right = pw(b"right");
    let opts = MountOptions::default();

    for _ in 0..2 {
        let outcome = control
            .mount_volume(slot(5), r"D:\vol.vg", Some(&right), &opts, report_flags())
            .unwrap();
        assert_eq!(outcome, MountOutcome::Failed(ControlError::WrongPassword));
    }
    let outcome = control
        .mount_volume(slot(5), r"D:\vol.vg", Some(&right), &opts, report_flags())
        .unwrap();
    assert!(matches!(outcome, MountOutcome::Mounted { mode: AccessMode::Exclusive, .. }));
    assert_eq!(control.wrong_password_count(), 0);
    assert!(control.take_warnings().contains(&ControlWarning::HeaderDamagedBackupUsed));
}

#[test]
fn unreported_wrong_password_does_not_count() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"right"));
    let mut control = control_for(&sim);
    let wrong = pw(b"wrong");
    let opts = MountOptions::default();
    let quiet = MountFlags { retry_if_in_use: true, ..MountFlags::default() };

    for _ in 0..4 {
        let outcome = control
            .mount_volume(slot(5), r"D:\vol.vg", Some(&wrong), &opts, quiet)
            .unwrap();
        assert_eq!(outcome, MountOutcome::Failed(ControlError::WrongPassword));
    }
    assert_eq!(control.wrong_password_count(), 0);
    // No escalation ever happened.
    assert!(sim.with(|s| s.kernel.mount_attempts.iter().all(|(backup, _)| !backup)));
}

#[test]
fn sharing_violation_downgrades_to_shared_once() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"D:\vol.vg", b"right");
        let vol = s.kernel.volumes.get_mut(r"\??\D:\vol.vg").unwrap();
        vol.share_violations = 1000;
        vol.share_violation_exclusive_only = true;
    });
    let mut control = control_for(&sim);
    let right = pw(b"right");
    let opts = MountOptions::default();

    let outcome = control
        .mount_volume(slot(5), r"D:\vol.vg", Some(&right), &opts, report_flags())
        .unwrap();
    assert!(matches!(outcome, MountOutcome::Mounted { mode: AccessMode::Shared, .. }));
    let attempts = sim.with(|s| s.kernel.mount_attempts.clone());
    assert_eq!(attempts, vec![(false, true), (false, false)]);
}

#[test]
fn sharing_violation_without_retry_is_file_in_use() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"D:\vol.vg", b"right");
        let vol = s.kernel.volumes.get_mut(r"\??\D:\vol.vg").unwrap();
        vol.share_violations = 1000;
    });
    let mut control = control_for(&sim);
    let right = pw(b"right");
    let opts = MountOptions::default();
    let flags = MountFlags { report_wrong_password: true, ..MountFlags::default() };

    assert_eq!(
        control.mount_volume(slot(5), r"D:\vol.vg", Some(&right), &opts, flags).unwrap_err(),
        ControlError::FileInUse
    );
}

#[test]
fn mount_on_arrival_retries_through_sharing_violations() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"D:\vol.vg", b"right");
        let vol = s.kernel.volumes.get_mut(r"\??\D:\vol.vg").unwrap();
        vol.share_violations = 3;
    });
    let mut control = control_for(&sim);
    control.set_mount_on_arrival(true);
    let right = pw(b"right");

    let outcome = control
        .mount_volume(slot(5), r"D:\vol.vg", Some(&right), &MountOptions::default(), report_flags())
        .unwrap();
    assert!(matches!(outcome, MountOutcome::Mounted { .. }));

    let arrival_waits = sim.with(|s| {
        s.sleeps.iter().filter(|d| **d == Duration::from_millis(500)).count()
    });
    assert_eq!(arrival_waits, 3);
    assert!(arrival_waits < MOUNT_ON_ARRIVAL_MAX_RETRIES as usize);
}

#[test]
fn cached_password_mount_requires_a_nonempty_cache() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"right"));
    let mut control = control_for(&sim);
    let opts = MountOptions::default();

    assert_eq!(
        control
            .mount_volume(slot(5), r"D:\vol.vg", None, &opts, MountFlags::default())
            .unwrap_err(),
        ControlError::PasswordNullAndNotCached
    );

    sim.with(|s| s.kernel.cached_passwords.push(b"right".to_vec()));
    let outcome = control
        .mount_volume(slot(5), r"D:\vol.vg", None, &opts, MountFlags::default())
        .unwrap();
    assert!(matches!(outcome, MountOutcome::Mounted { .. }));
}

#[test]
fn occupied_drive_letter_is_refused() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"right"));
    let mut control = control_for(&sim);
    let right = pw(b"right");

    // C: is assigned in the default world.
    assert_eq!(
        control
            .mount_volume(slot(2), r"D:\vol.vg", Some(&right), &MountOptions::default(), report_flags())
            .unwrap_err(),
        ControlError::DriveLetterUnavailable
    );
}

#[test]
fn host_read_only_filesystem_upgrades_the_request() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"E:\data\vault.vg", b"right");
        s.volume_roots.insert(r"E:\data\vault.vg".to_string(), r"E:\".to_string());
        s.sector_sizes.insert(r"E:\".to_string(), 4096);
        s.read_only_roots.insert(r"E:\".to_string());
    });
    let mut control = control_for(&sim);
    let right = pw(b"right");

    let outcome = control
        .mount_volume(slot(5), r"E:\data\vault.vg", Some(&right), &MountOptions::default(), report_flags())
        .unwrap();
    assert!(matches!(outcome, MountOutcome::Mounted { .. }));
    sim.with(|s| {
        let snap = s.kernel.last_mount.expect("mount reached the driver");
        assert!(snap.read_only, "read-only must be upgraded from the host filesystem");
        assert_eq!(snap.bytes_per_sector, 4096);
    });
}

#[test]
fn interactive_loop_retries_until_the_right_password() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"third-time-lucky"));
    let mut control = control_for(&sim);

    let mut creds =
        VecCredential(vec![pw(b"first"), pw(b"second"), pw(b"third-time-lucky")]);
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    let report = control.mount(slot(7), r"D:\vol.vg", &mut session).expect("mount");
    assert_eq!(report.mode, AccessMode::Exclusive);
    assert_eq!(control.wrong_password_count(), 0);
}

#[test]
fn interactive_abort_is_cancelled() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"right"));
    let mut control = control_for(&sim);

    let mut creds = VecCredential(vec![pw(b"wrong")]);
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    assert_eq!(
        control.mount(slot(7), r"D:\vol.vg", &mut session).unwrap_err(),
        ControlError::Cancelled
    );
}

#[test]
fn command_line_password_is_single_shot() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vol.vg", b"right"));
    let mut control = control_for(&sim);

    let mut creds = VecCredential(vec![]);
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: Some(pw(b"wrong")),
        silent: false,
        force_shared: false,
    };
    assert_eq!(
        control.mount(slot(7), r"D:\vol.vg", &mut session).unwrap_err(),
        ControlError::WrongPassword
    );
}

#[test]
fn bulk_operations_reuse_the_previous_password() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"D:\a.vg", b"shared-secret");
        s.add_file_volume(r"D:\b.vg", b"shared-secret");
    });
    let mut control = control_for(&sim);
    control.set_bulk_operation(true);

    let mut creds = VecCredential(vec![pw(b"shared-secret")]);
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    control.mount(slot(7), r"D:\a.vg", &mut session).expect("first volume");

    // Second volume mounts from the carried password; the credential
    // source is exhausted and must not be consulted.
    let mut creds = VecCredential(vec![]);
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    control.mount(slot(8), r"D:\b.vg", &mut session).expect("second volume");
    control.set_bulk_operation(false);
}

#[test]
fn missing_volume_fails_before_the_driver() {
    let sim = SimWorld::new();
    let mut control = control_for(&sim);
    let mut creds = VecCredential(vec![]);
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    assert!(matches!(
        control.mount(slot(7), r"D:\absent.vg", &mut session).unwrap_err(),
        ControlError::Os(_)
    ));
}

#[test]
fn problematic_extension_warns_after_mounting() {
    let sim = SimWorld::new();
    sim.with(|s| s.add_file_volume(r"D:\vault.zip", b"right"));
    let mut control = control_for(&sim);

    let mut creds = FixedCredential::new(pw(b"right"));
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    control.mount(slot(7), r"D:\vault.zip", &mut session).expect("mount");
    assert!(control.take_warnings().contains(&ControlWarning::ProblematicFileExtension));
}

#[test]
fn deprecated_cipher_mode_warns_after_mounting() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.add_file_volume(r"D:\old.vg", b"right");
        let vol = s.kernel.volumes.get_mut(r"\??\D:\old.vg").unwrap();
        vol.properties = control::VolumeProperties {
            mode_of_operation: control::modes::CBC,
            min_cipher_block_bits: 64,
        };
    });
    let mut control = control_for(&sim);

    let mut creds = FixedCredential::new(pw(b"right"));
    let mut session = MountSession {
        credentials: &mut creds,
        command_line_password: None,
        silent: false,
        force_shared: false,
    };
    control.mount(slot(7), r"D:\old.vg", &mut session).expect("mount");
    let warnings = control.take_warnings();
    assert!(warnings.contains(&ControlWarning::DeprecatedCipherMode));
    assert!(warnings.contains(&ControlWarning::SmallBlockCipher));
}

#[test]
fn sysenc_scope_rejects_whole_drives() {
    let sim = SimWorld::new();
    let mut control = control_for(&sim);
    let opts = MountOptions {
        partition_in_inactive_sysenc_scope: true,
        ..MountOptions::default()
    };
    assert_eq!(
        control
            .mount_volume(slot(5), r"\Device\Harddisk2\Partition0", Some(&pw(b"x")), &opts, report_flags())
            .unwrap_err(),
        ControlError::NotSysEncPartition
    );
}

#[test]
fn sysenc_scope_refuses_partitions_on_the_active_system_drive() {
    let sim = SimWorld::new();
    sim.with(|s| {
        // Harddisk0: whole drive, the system partition (C:), and the
        // target partition.
        s.kernel.devices.insert(
            r"\Device\Harddisk0\Partition0".to_string(),
            volgate::os::sim::SimDevice {
                openable: true,
                partition: control::PartitionInfo { partition_len: 500_000, ..Default::default() },
                ..Default::default()
            },
        );
        s.kernel.devices.insert(
            r"\Device\Harddisk0\Partition1".to_string(),
            volgate::os::sim::SimDevice {
                openable: true,
                partition: control::PartitionInfo { partition_len: 100_000, ..Default::default() },
                ..Default::default()
            },
        );
        s.kernel
            .symlinks
            .insert(r"\Device\Harddisk0\Partition1".to_string(), r"\Device\HarddiskVolume1".to_string());
        s.dos_devices.insert("C:".to_string(), r"\Device\HarddiskVolume1".to_string());
        s.add_device_volume(r"\Device\Harddisk0\Partition2", b"right");
        if let Some(dev) = s.kernel.devices.get_mut(r"\Device\Harddisk0\Partition2") {
            dev.partition.partition_len = 200_000;
        }
        s.system_drive_mounted = true;
    });
    let mut control = control_for(&sim);
    let opts = MountOptions {
        partition_in_inactive_sysenc_scope: true,
        ..MountOptions::default()
    };

    assert_eq!(
        control
            .mount_volume(slot(5), r"\Device\Harddisk0\Partition2", Some(&pw(b"right")), &opts, report_flags())
            .unwrap_err(),
        ControlError::MountOnActiveSysEncDrive
    );
}
