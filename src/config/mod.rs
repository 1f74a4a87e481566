// src/config/mod.rs

//! Configuration: raw TOML structures and the runtime options derived
//! from them.

pub mod loader;
pub mod types;

pub use loader::{load_control_config, options_from_config};
pub use types::{ControlConfig, ControlOptions, DriverSection, LoggingSection, MountSection};
