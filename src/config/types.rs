//! Configuration structures.
//!
//! Distinguishes the raw TOML file format (`ControlConfig`, all
//! optional, serde-deserialized) from the runtime options the context
//! actually carries (`ControlOptions`, fully resolved defaults).
//!
//! Key responsibilities:
//! - Define the TOML sections (logging, driver, mount defaults).
//! - Resolve them into `ControlOptions` with the documented defaults.
//! - Keep the config file format separate from logic-layer usage.

use std::path::PathBuf;

use serde::Deserialize;

use crate::mount::MountOptions;

/// Raw `[logging]` block, same shape the binary's fern setup expects.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection { enable: false, level: default_log_level(), file: None }
    }
}

/// Raw `[driver]` block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriverSection {
    /// Explicit driver binary to load as a transient service. Setting
    /// this selects portable mode; leaving it unset uses the
    /// installed driver.
    pub path: Option<PathBuf>,
    /// Mirror of the system-encryption configuration flag kept by the
    /// main application.
    #[serde(default)]
    pub system_encryption_active: bool,
}

/// Raw `[mount]` block of per-volume defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct MountSection {
    #[serde(default)]
    pub cache_passwords: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub removable: bool,
    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MountSection {
    fn default() -> Self {
        MountSection {
            cache_passwords: false,
            read_only: false,
            removable: false,
            preserve_timestamps: true,
        }
    }
}

/// Whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub driver: Option<DriverSection>,
    #[serde(default)]
    pub mount: Option<MountSection>,
}

/// Resolved runtime options held by the control context.
#[derive(Debug, Clone, Default)]
pub struct ControlOptions {
    pub driver_path: Option<PathBuf>,
    pub system_encryption_active: bool,
    pub cache_passwords: bool,
    pub mount_read_only: bool,
    pub mount_removable: bool,
    pub preserve_timestamps: bool,
}

impl ControlOptions {
    /// Per-volume mount options seeded from these defaults.
    pub fn mount_defaults(&self) -> MountOptions {
        MountOptions {
            read_only: self.mount_read_only,
            removable: self.mount_removable,
            preserve_timestamp: self.preserve_timestamps,
            ..MountOptions::default()
        }
    }
}
