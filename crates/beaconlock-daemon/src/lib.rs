//! # beaconlock-daemon
//!
//! Process plumbing for the beaconlock daemon: environment settings,
//! logging, signal handling and the exit status. The monitoring logic lives
//! in `beaconlock-core`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod logging;
pub mod settings;
pub mod signals;

use beaconlock_core::error::{BeaconLockError, EXIT_SETUP_FAILURE};

/// Exit status for an error that ended the daemon.
///
/// Errors carrying a [`BeaconLockError`] anywhere in their chain use its
/// code; anything else is a startup failure.
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BeaconLockError>())
        .map_or(EXIT_SETUP_FAILURE, BeaconLockError::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use beaconlock_core::{ConfigError, DeviceError};

    #[test]
    fn test_exit_code_from_wrapped_error() {
        let result: Result<(), BeaconLockError> = Err(DeviceError::NotConnected.into());
        let err = result.context("Beacon link setup failed").unwrap_err();
        assert_eq!(exit_code(&err), EXIT_SETUP_FAILURE);
    }

    #[test]
    fn test_exit_code_for_config_error() {
        let err = anyhow::Error::new(BeaconLockError::from(ConfigError::Validation {
            field: "device.address".into(),
            message: "bad".into(),
        }));
        assert_eq!(exit_code(&err), EXIT_SETUP_FAILURE);
    }

    #[test]
    fn test_exit_code_for_other_errors() {
        let err = anyhow::anyhow!("signal handler");
        assert_eq!(exit_code(&err), EXIT_SETUP_FAILURE);
    }
}
