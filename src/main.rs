// src/main.rs

//! Console walk-through for the control library.
//!
//! 1. Load `volgate.toml` next to the executable & set up logging
//! 2. Initialize the control context against the live OS
//! 3. Run the requested action: attach, mount, unmount, devices
//! 4. Print the structured status code on the way out
//!
// ───── std / 3rd-party imports ──────────────────────────────────────────────
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;

// ───── local imports ────────────────────────────────────────────────────────
use volgate::config::{LoggingSection, load_control_config, options_from_config};
use volgate::devices::EnumerateOptions;
use volgate::mount::unmount::NeverForce;
use volgate::os::native_host;
use volgate::{
    ControlOptions, DriveSlot, FixedCredential, MountSession, Password, VolumeControl,
};

// ───── helpers ──────────────────────────────────────────────────────────────

/// Directory that contains the running executable.
fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .expect("Cannot determine exe path")
        .parent()
        .expect("Executable must live in some directory")
        .to_path_buf()
}

/// Configure global logging as requested in the `[logging]` section.
fn setup_logging(exe_dir: &Path, logging: &LoggingSection) -> Result<(), fern::InitError> {
    let level = match logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let log_path = logging
        .enable
        .then(|| exe_dir.join(logging.file.as_deref().unwrap_or("volgate.log")));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                msg
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

fn read_password(prompt: &str) -> anyhow::Result<Password> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Password::new(trimmed.as_bytes()).context("invalid password")
}

fn parse_slot(letter: &str) -> anyhow::Result<DriveSlot> {
    let c = letter
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_uppercase());
    match c {
        Some(c) => DriveSlot::new(c as u8 - b'A').context("drive letter out of range"),
        None => bail!("expected a drive letter, got {letter:?}"),
    }
}

fn usage() -> ! {
    eprintln!("usage: volgate <attach | detach | devices | mount <letter> <volume> | unmount <letter>>");
    std::process::exit(2);
}

// ───── actions ──────────────────────────────────────────────────────────────

fn run(control: &mut VolumeControl, args: &[String]) -> anyhow::Result<()> {
    match args.first().map(String::as_str) {
        Some("attach") => {
            let version = control.attach()?;
            println!("attached, driver protocol version {version:#06x}");
        }
        Some("detach") => {
            control.attach()?;
            control.detach()?;
            println!("driver unloaded");
        }
        Some("devices") => {
            control.attach()?;
            let devices = control.enumerate_host_devices(&EnumerateOptions::default())?;
            for dev in devices {
                println!(
                    "{:3} {:45} {:>12}  {}",
                    dev.system_number,
                    dev.path,
                    dev.size,
                    dev.mount_point.unwrap_or_default()
                );
                for part in dev.partitions {
                    println!(
                        "     {:43} {:>12}  {}",
                        part.path,
                        part.size,
                        part.mount_point.unwrap_or_default()
                    );
                }
            }
        }
        Some("mount") => {
            let [_, letter, volume] = args else { usage() };
            let slot = parse_slot(letter)?;
            control.attach()?;
            let password = read_password(&format!("password for {volume}: "))?;
            let mut creds = FixedCredential::new(password);
            let mut session = MountSession {
                credentials: &mut creds,
                command_line_password: None,
                silent: false,
                force_shared: false,
            };
            let report = control.mount(slot, volume, &mut session)?;
            println!("mounted at {slot} ({:?})", report.mode);
            if report.filesystem_dirty {
                println!("note: filesystem was marked dirty; consider checking it");
            }
            for warning in control.take_warnings() {
                println!("warning: {warning:?}");
            }
        }
        Some("unmount") => {
            let [_, letter] = args else { usage() };
            let slot = parse_slot(letter)?;
            control.attach()?;
            control.unmount(slot, false, &NeverForce)?;
            println!("unmounted {slot}");
            for warning in control.take_warnings() {
                println!("warning: {warning:?}");
            }
        }
        _ => usage(),
    }
    Ok(())
}

fn main() {
    let exe_dir = exe_dir();
    let config_path = exe_dir.join("volgate.toml");
    let config = if config_path.exists() {
        load_control_config(&config_path).unwrap_or_else(|e| {
            eprintln!("config error: {e}");
            std::process::exit(1);
        })
    } else {
        Default::default()
    };

    let logging = config.logging.clone().unwrap_or_default();
    setup_logging(&exe_dir, &logging).expect("Logging setup failed");

    let options: ControlOptions = options_from_config(&config);

    let host = match native_host() {
        Ok(host) => host,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut control = match VolumeControl::initialize(host, options) {
        Ok(control) => control,
        Err(e) => {
            eprintln!("initialize failed: {e}");
            std::process::exit(1);
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&mut control, &args) {
        let status = control.last_status();
        eprintln!("error: {e} (status {:#010x})", status.0);
        std::process::exit(1);
    }
}
