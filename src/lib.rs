// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export the context type and the
// vocabulary types for both `main.rs` and integration tests.

pub mod broadcast;
pub mod config;
pub mod devices;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod mount;
pub mod os;
pub mod password;
pub mod volume;

mod api;

pub use api::VolumeControl;
pub use config::ControlOptions;
pub use error::{ControlError, ControlWarning, Result, StatusCode};
pub use mount::{
    AccessMode, CredentialSource, DriveSlot, FixedCredential, MountFlags, MountOptions,
    MountOutcome, MountReport, MountSession, NoCredentials,
    unmount::{ForcedUnmountConsent, NeverForce},
};
pub use password::Password;
