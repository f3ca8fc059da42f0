//! # beaconlock-core
//!
//! Core logic for the beaconlock proximity screen-lock daemon.
//!
//! A BLE beacon carried by the user is kept connected; its RSSI is polled,
//! turned into a distance estimate, and fed through a hysteresis state
//! machine. When the beacon leaves, every configured display is locked; when
//! it comes back, the locks are released.
//!
//! ## Architecture
//!
//! - [`link`] - Link-layer driver trait and the [`DeviceController`] that owns
//!   the beacon connection
//! - [`distance`] - RSSI to distance estimation
//! - [`monitor`] - Presence state machine and polling loop
//! - [`lock`] - Per-display screen locking
//! - [`supervisor`] - Setup, monitoring and teardown for one run
//! - [`shutdown`] - Cooperative shutdown signalling
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Unified error type
//! - [`types`] - Shared value types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod distance;
pub mod error;
pub mod link;
pub mod lock;
pub mod monitor;
pub mod shutdown;
pub mod supervisor;
pub mod types;

pub use config::{
    default_config_path, CalibrationConfig, Config, ConfigError, ConfigResult, DeviceConfig,
    LinkTimeouts, LockConfig, ProximityConfig, RadioParams, RssiBand, SetupConfig,
    TimeoutsConfig,
};
pub use distance::{estimate_distance, DistanceModel, NO_READING, NO_SIGNAL};
pub use error::{BeaconLockError, Result};
#[cfg(feature = "bluetooth")]
pub use link::bluez::BluezDriver;
pub use link::{DeviceController, DeviceError, DeviceResult, LinkDriver, LinkError};
pub use lock::{CommandSurface, Coverage, LockController, LockError, LockReport, LockSurface};
pub use monitor::{LockIntent, MonitorSummary, ProximityMonitor, ProximityState, Transition};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use supervisor::{RunSummary, Supervisor};
pub use types::{
    is_valid_mac_address, AddressType, BeaconAddress, BeaconDevice, ConnectionHandle,
    SurfaceId, VersionInfo,
};
