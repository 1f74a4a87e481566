//! Cross-process setup serialization.
//!
//! A named system mutex keeps multiple processes from installing or
//! attaching the driver at the same time. The create-owned call is the
//! only primitive the platform gives us, and it races: creation can
//! succeed while the OS reports the mutex already existed. That case
//! is handled by immediately releasing and closing the handle, not by
//! treating it as an error in the primitive.

use std::time::Duration;

use log::debug;

use crate::os::{Clock, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, MutexHandle, MutexHost};

/// Attempts before giving up on the gate, and the pause between them.
/// Bounds the total wait to roughly half a second so a misbehaving
/// holder cannot hang us forever.
pub const GATE_ACQUIRE_TRIES: u32 = 5;
pub const GATE_ACQUIRE_DELAY: Duration = Duration::from_millis(100);

/// One logical instance's hold on a named setup mutex.
pub struct SetupGate {
    name: String,
    held: Option<MutexHandle>,
}

impl SetupGate {
    pub fn new(name: impl Into<String>) -> Self {
        SetupGate { name: name.into(), held: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Single acquisition attempt. Re-acquiring a gate this instance
    /// already holds succeeds without touching the OS.
    pub fn acquire(&mut self, mutexes: &dyn MutexHost) -> bool {
        if self.held.is_some() {
            return true;
        }
        match mutexes.create_owned(&self.name) {
            Err(_) => {
                // Outright failure is a permissions problem (an
                // elevated owner, or another user's session), not
                // contention.
                false
            }
            Ok(created) if created.already_existed => {
                // Lost the create race to another instance. The OS
                // still handed us a handle; give it back right away.
                mutexes.release_and_close(created.handle);
                false
            }
            Ok(created) => {
                self.held = Some(created.handle);
                true
            }
        }
    }

    /// Bounded caller-level retry: up to [`GATE_ACQUIRE_TRIES`]
    /// attempts, sleeping [`GATE_ACQUIRE_DELAY`] after each failure.
    pub fn acquire_with_retries(&mut self, mutexes: &dyn MutexHost, clock: &dyn Clock) -> bool {
        let mut tries = GATE_ACQUIRE_TRIES;
        while tries > 0 {
            if self.acquire(mutexes) {
                return true;
            }
            debug!(target: "volgate::ipc", "setup gate busy, {tries} tries left");
            clock.sleep(GATE_ACQUIRE_DELAY);
            tries -= 1;
        }
        self.is_held()
    }

    /// Release and close if held; afterwards a fresh `acquire` starts
    /// from scratch.
    pub fn release(&mut self, mutexes: &dyn MutexHost) {
        if let Some(handle) = self.held.take() {
            if !mutexes.release_and_close(handle) {
                // Handle could not be cleanly returned; leaving `held`
                // empty is still correct, the OS reclaims it on exit.
                debug!(target: "volgate::ipc", "setup gate handle abandoned");
            }
        }
    }
}

/// Whether any process on the system holds the named mutex.
///
/// Access-denied on open means an elevated owner exists, so it counts
/// as present. Any failure other than not-found is reported as absent:
/// a false "exists" would block legitimate operations.
pub fn mutex_exists_on_system(mutexes: &dyn MutexHost, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    match mutexes.open_existing(name) {
        Ok(()) => true,
        Err(ERROR_FILE_NOT_FOUND) => false,
        Err(ERROR_ACCESS_DENIED) => true,
        Err(_) => false,
    }
}

/// Probe for a concurrently running installer instance.
pub fn is_installer_running(mutexes: &dyn MutexHost, installer_mutex_name: &str) -> bool {
    mutex_exists_on_system(mutexes, installer_mutex_name)
}
