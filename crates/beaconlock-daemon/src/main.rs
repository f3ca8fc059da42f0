//! # beaconlock
//!
//! Locks every configured X display when the paired BLE beacon walks away
//! and unlocks them when it comes back.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package beaconlock-daemon --features bluetooth
//!
//! # Production
//! BEACONLOCK_ENV=production beaconlock
//! ```
//!
//! Exits 0 after a clean SIGINT/SIGTERM shutdown and 1 when configuration or
//! link setup fails.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::process::ExitCode;

use anyhow::Context;
use beaconlock_core::{shutdown, BeaconLockError, BluezDriver, CommandSurface, Config, Supervisor};
use beaconlock_daemon::settings::Settings;
use beaconlock_daemon::{exit_code, logging, signals};
use tracing::{debug, error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let settings = Settings::from_env();
    if let Err(e) = logging::init(&settings) {
        eprintln!("beaconlock: failed to initialize logging: {e:#}");
        return ExitCode::from(exit_code(&e));
    }

    match run(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            error!(error = format!("{e:#}"), code, "beaconlock exiting");
            ExitCode::from(code)
        }
    }
}

async fn run(settings: &Settings) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting beaconlock");

    let config = Config::load(settings.config_path.as_deref())
        .map_err(BeaconLockError::from)
        .context("Failed to load configuration")?;
    debug!(config = %config.to_toml_string()?, "Effective configuration");

    let (trigger, shutdown) = shutdown::channel();
    let listener = signals::spawn(trigger).context("Failed to install signal handlers")?;

    let supervisor = Supervisor::new(
        BluezDriver::new(),
        CommandSurface::new(&config.lock),
        &config,
    )
    .map_err(BeaconLockError::from)
    .context("Invalid beacon configuration")?;
    let result = supervisor.run(shutdown).await;
    listener.abort();

    let summary = result.context("Beacon link setup failed")?;
    info!(
        cycles = summary.monitor.cycles,
        transitions = summary.monitor.transitions,
        read_failures = summary.monitor.read_failures,
        "beaconlock stopped"
    );
    Ok(())
}
