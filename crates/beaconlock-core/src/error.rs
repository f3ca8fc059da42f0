//! Unified error type for the beaconlock core library.
//!
//! Each module keeps its own error enum. [`BeaconLockError`] wraps the ones
//! that can stop the daemon ([`ConfigError`], [`DeviceError`]) for callers
//! that only care about the broad failure class, such as the exit path.
//! Lock failures never stop the daemon; the monitor logs them and retries.
//!
//! # Example
//!
//! ```rust
//! use beaconlock_core::error::{BeaconLockError, Result};
//! use beaconlock_core::Config;
//!
//! fn load() -> Result<Config> {
//!     let config = Config::from_toml_str("[device]\nadapter = \"hci1\"\n")?;
//!     Ok(config)
//! }
//!
//! assert_eq!(load().unwrap().device.adapter, "hci1");
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::link::DeviceError;

/// Exit status for configuration and setup failures.
pub const EXIT_SETUP_FAILURE: u8 = 1;

/// The unified error type for all beaconlock operations.
#[derive(Debug, Error)]
pub enum BeaconLockError {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The beacon link could not be set up or used.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// A specialized [`Result`] type for beaconlock operations.
pub type Result<T> = std::result::Result<T, BeaconLockError>;

impl BeaconLockError {
    /// Returns `true` if retrying later could succeed without user intervention.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Device(e) => e.is_transient(),
        }
    }

    /// Machine-readable error code for logs.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::Load(_)) => "CONFIG_LOAD",
            Self::Config(ConfigError::Serialize(_)) => "CONFIG_SERIALIZE",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Device(DeviceError::Open { .. }) => "DEVICE_OPEN",
            Self::Device(DeviceError::Whitelist { .. }) => "DEVICE_WHITELIST",
            Self::Device(DeviceError::Connection { .. }) => "DEVICE_CONNECTION",
            Self::Device(DeviceError::UnsupportedDevice { .. }) => "DEVICE_UNSUPPORTED",
            Self::Device(DeviceError::VersionRead(_)) => "DEVICE_VERSION_READ",
            Self::Device(DeviceError::RssiRead(_)) => "DEVICE_RSSI_READ",
            Self::Device(DeviceError::Disconnect(_)) => "DEVICE_DISCONNECT",
            Self::Device(DeviceError::Encryption(_)) => "DEVICE_ENCRYPTION",
            Self::Device(DeviceError::NotConnected) => "DEVICE_NOT_CONNECTED",
        }
    }

    /// Process exit status for this error.
    ///
    /// Both variants end the run before or during link setup.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Device(_) => EXIT_SETUP_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkError;
    use crate::types::{AddressType, BeaconAddress, BeaconDevice};
    use std::time::Duration;

    fn beacon() -> BeaconDevice {
        BeaconDevice {
            address: BeaconAddress::new([0, 7, 0x80, 0x7F, 0x59, 0x9E]),
            address_type: AddressType::Public,
        }
    }

    #[test]
    fn test_config_errors_are_not_recoverable() {
        let config: BeaconLockError = ConfigError::Validation {
            field: "device.address".into(),
            message: "bad".into(),
        }
        .into();
        let device: BeaconLockError = DeviceError::UnsupportedDevice {
            found: 5,
            required: 6,
        }
        .into();

        assert!(!config.is_recoverable());
        assert!(!device.is_recoverable());
        assert_eq!(config.error_code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_recoverable_errors() {
        let timeout: BeaconLockError = DeviceError::Connection {
            device: beacon(),
            source: LinkError::Timeout(Duration::from_secs(25)),
        }
        .into();
        let rejected: BeaconLockError = DeviceError::Connection {
            device: beacon(),
            source: LinkError::Rejected("denied".into()),
        }
        .into();
        let whitelist: BeaconLockError = DeviceError::Whitelist {
            device: beacon(),
            source: LinkError::Timeout(Duration::from_secs(1)),
        }
        .into();

        assert!(timeout.is_recoverable());
        assert!(!rejected.is_recoverable());
        assert!(!whitelist.is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        let err: BeaconLockError = DeviceError::NotConnected.into();
        assert_eq!(err.error_code(), "DEVICE_NOT_CONNECTED");

        let err: BeaconLockError = ConfigError::MultipleValidation(vec![]).into();
        assert_eq!(err.error_code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_exit_codes() {
        let device: BeaconLockError = DeviceError::Open {
            adapter: "hci0".into(),
            source: LinkError::AdapterUnavailable("hci0".into()),
        }
        .into();
        let config: BeaconLockError = ConfigError::Validation {
            field: "lock.command".into(),
            message: "empty".into(),
        }
        .into();

        assert_eq!(device.exit_code(), EXIT_SETUP_FAILURE);
        assert_eq!(config.exit_code(), EXIT_SETUP_FAILURE);
    }

    #[test]
    fn test_display_includes_source() {
        let err: BeaconLockError = DeviceError::UnsupportedDevice {
            found: 5,
            required: 6,
        }
        .into();
        assert!(err.to_string().starts_with("device error:"));
    }
}
