//! Integration tests for the cross-process setup gate.
//!
//! Two `SetupGate` values over one simulated mutex table stand in for
//! two process instances racing to configure the driver.
//!
//! Key responsibilities:
//! - Verify idempotent re-acquisition by the same instance.
//! - Verify exclusion between instances until release.
//! - Verify the bounded caller-level retry policy.
//! - Verify the read-only existence probe's error interpretation.

use std::time::Duration;

use volgate::ipc::{GATE_ACQUIRE_TRIES, SetupGate, is_installer_running, mutex_exists_on_system};
use volgate::os::sim::SimWorld;

const NAME: &str = r"Global\VolGate Driver Setup";

#[test]
fn acquire_is_idempotent_per_instance() {
    let sim = SimWorld::new();
    let mutexes = sim.mutex_host();
    let mut gate = SetupGate::new(NAME);

    assert!(gate.acquire(mutexes.as_ref()));
    let handles_after_first = sim.with(|s| s.open_mutex_handles());

    // Second and later acquisitions succeed without touching the OS.
    assert!(gate.acquire(mutexes.as_ref()));
    assert!(gate.acquire(mutexes.as_ref()));
    assert_eq!(sim.with(|s| s.open_mutex_handles()), handles_after_first);
    assert!(gate.is_held());

    gate.release(mutexes.as_ref());
    assert!(!gate.is_held());
    assert_eq!(sim.with(|s| s.open_mutex_handles()), 0);
}

#[test]
fn second_instance_is_excluded_until_release() {
    let sim = SimWorld::new();
    let host_a = sim.mutex_host();
    let host_b = sim.mutex_host();
    let mut gate_a = SetupGate::new(NAME);
    let mut gate_b = SetupGate::new(NAME);

    assert!(gate_a.acquire(host_a.as_ref()));
    assert!(!gate_b.acquire(host_b.as_ref()));
    assert!(!gate_b.is_held());
    // The lost create race must not leak a handle.
    assert_eq!(sim.with(|s| s.open_mutex_handles()), 1);

    gate_a.release(host_a.as_ref());
    assert!(gate_b.acquire(host_b.as_ref()));
    assert!(gate_b.is_held());
}

#[test]
fn retry_policy_is_bounded() {
    let sim = SimWorld::new();
    let host_a = sim.mutex_host();
    let host_b = sim.mutex_host();
    let mut gate_a = SetupGate::new(NAME);
    let mut gate_b = SetupGate::new(NAME);
    let clock = sim.host().clock;

    assert!(gate_a.acquire(host_a.as_ref()));
    assert!(!gate_b.acquire_with_retries(host_b.as_ref(), clock.as_ref()));

    let sleeps = sim.with(|s| s.sleeps.clone());
    assert_eq!(sleeps.len(), GATE_ACQUIRE_TRIES as usize);
    assert!(sleeps.iter().all(|d| *d == Duration::from_millis(100)));
}

#[test]
fn creation_denied_counts_as_busy() {
    let sim = SimWorld::new();
    sim.with(|s| {
        s.denied_mutexes.insert(NAME.to_string());
    });
    let mutexes = sim.mutex_host();
    let mut gate = SetupGate::new(NAME);
    assert!(!gate.acquire(mutexes.as_ref()));
}

#[test]
fn existence_probe_interprets_open_errors() {
    let sim = SimWorld::new();
    let mutexes = sim.mutex_host();

    // Absent mutex.
    assert!(!mutex_exists_on_system(mutexes.as_ref(), NAME));
    assert!(!mutex_exists_on_system(mutexes.as_ref(), ""));

    // Held by someone.
    let mut gate = SetupGate::new(NAME);
    assert!(gate.acquire(mutexes.as_ref()));
    assert!(mutex_exists_on_system(mutexes.as_ref(), NAME));
    gate.release(mutexes.as_ref());

    // Access denied on open means an elevated owner: exists.
    sim.with(|s| {
        s.denied_mutexes.insert(r"Global\VolGate Setup".to_string());
    });
    assert!(is_installer_running(mutexes.as_ref(), r"Global\VolGate Setup"));
}
