// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the control-plane TOML file, deserializes it into
//! `ControlConfig`, and resolves it into runtime `ControlOptions`.

use std::{fs, path::Path};

use log::{debug, info};

use crate::config::types::{ControlConfig, ControlOptions};

/// Load and parse the configuration from `path`.
/// Logs at DEBUG before reading and INFO on success.
pub fn load_control_config(path: &Path) -> Result<ControlConfig, Box<dyn std::error::Error>> {
    debug!(target: "volgate::config", "reading config from {path:?}");
    let txt = fs::read_to_string(path)?;
    let cfg: ControlConfig = toml::from_str(&txt)?;
    info!(target: "volgate::config", "loaded config from {path:?}");
    Ok(cfg)
}

/// Resolve a raw config into runtime options.
pub fn options_from_config(cfg: &ControlConfig) -> ControlOptions {
    let driver = cfg.driver.clone().unwrap_or_default();
    let mount = cfg.mount.clone().unwrap_or_default();
    let options = ControlOptions {
        driver_path: driver.path,
        system_encryption_active: driver.system_encryption_active,
        cache_passwords: mount.cache_passwords,
        mount_read_only: mount.read_only,
        mount_removable: mount.removable,
        preserve_timestamps: mount.preserve_timestamps,
    };
    debug!(
        target: "volgate::config",
        "resolved options: portable={} cache_passwords={}",
        options.driver_path.is_some(),
        options.cache_passwords
    );
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_a_full_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logging]
enable = true
level = "DEBUG"
file = "volgate.log"

[driver]
path = 'C:\tools\volgate.sys'
system_encryption_active = false

[mount]
cache_passwords = true
read_only = true
"#
        )
        .unwrap();

        let cfg = load_control_config(file.path()).unwrap();
        let opts = options_from_config(&cfg);
        assert!(opts.driver_path.is_some());
        assert!(opts.cache_passwords);
        assert!(opts.mount_read_only);
        assert!(opts.preserve_timestamps); // default stays on
        assert_eq!(cfg.logging.unwrap().level, "DEBUG");
    }

    #[test]
    fn empty_config_resolves_to_defaults() {
        let cfg: ControlConfig = toml::from_str("").unwrap();
        let opts = options_from_config(&cfg);
        assert!(opts.driver_path.is_none());
        assert!(!opts.cache_passwords);
        assert!(opts.preserve_timestamps);
    }
}
