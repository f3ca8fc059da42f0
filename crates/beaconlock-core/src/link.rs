//! Link-layer access to the beacon.
//!
//! This module provides:
//! - [`LinkDriver`], the raw whitelist/connect/read/disconnect primitives a
//!   Bluetooth transport must offer
//! - [`DeviceController`], which owns the single connection to the beacon and
//!   turns driver calls into typed, bounded operations
//! - A BlueZ-backed driver (`bluetooth` feature) and a scripted mock driver
//!   (`mock-bluetooth` feature, always available to tests)

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::config::RadioParams;
use crate::types::{
    AddressType, BeaconAddress, BeaconDevice, ConnectionHandle, DisconnectReason, VersionInfo,
};

#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod controller;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;
#[cfg_attr(not(feature = "bluetooth"), allow(dead_code))]
mod sample;

pub use controller::{Connection, ConnectionState, DeviceController};

/// Failure reported by a [`LinkDriver`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The local controller could not be opened.
    #[error("adapter '{0}' is not available")]
    AdapterUnavailable(String),

    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection handle does not refer to a live connection.
    #[error("no active connection for handle {0}")]
    NotConnected(ConnectionHandle),

    /// The controller answered without a value.
    #[error("no reading available")]
    NoReading,

    /// The controller or peer refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Raw link-layer primitives.
///
/// Every request carries its own timeout; implementations must return
/// [`LinkError::Timeout`] rather than block past it. A link handle is opened
/// per operation and closed afterwards, mirroring an HCI socket per request.
pub trait LinkDriver: Send {
    /// Open handle on the local controller.
    type Link: Send + Sync;

    /// Open the named local controller.
    fn open_link(
        &mut self,
        device_id: &str,
    ) -> impl Future<Output = Result<Self::Link, LinkError>> + Send;

    /// Close a handle returned by [`Self::open_link`].
    fn close_link(&mut self, link: Self::Link);

    /// Add `address` to the controller's accept list.
    fn set_whitelist(
        &mut self,
        link: &Self::Link,
        address: BeaconAddress,
        address_type: AddressType,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Establish an LE connection to `address` with the given parameters.
    fn create_connection(
        &mut self,
        link: &Self::Link,
        params: &RadioParams,
        address: BeaconAddress,
        address_type: AddressType,
        timeout: Duration,
    ) -> impl Future<Output = Result<ConnectionHandle, LinkError>> + Send;

    /// Terminate the connection identified by `handle`.
    fn disconnect_connection(
        &mut self,
        link: &Self::Link,
        handle: ConnectionHandle,
        reason: DisconnectReason,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Read the RSSI of the connection in dBm.
    fn read_rssi(
        &mut self,
        link: &Self::Link,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> impl Future<Output = Result<i8, LinkError>> + Send;

    /// Read the peer's link-layer version.
    fn read_remote_version(
        &mut self,
        link: &Self::Link,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> impl Future<Output = Result<VersionInfo, LinkError>> + Send;

    /// Ask the controller to encrypt the connection.
    fn request_encryption(
        &mut self,
        link: &Self::Link,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// Errors from [`DeviceController`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The local controller could not be opened.
    #[error("could not open adapter '{adapter}': {source}")]
    Open {
        /// Adapter name.
        adapter: String,
        /// Driver failure.
        source: LinkError,
    },

    /// The beacon could not be added to the accept list.
    #[error("could not whitelist {device}: {source}")]
    Whitelist {
        /// Beacon that was being added.
        device: BeaconDevice,
        /// Driver failure.
        source: LinkError,
    },

    /// Connection establishment failed or timed out.
    #[error("could not connect to {device}: {source}")]
    Connection {
        /// Beacon that was being connected.
        device: BeaconDevice,
        /// Driver failure.
        source: LinkError,
    },

    /// The peer's link layer is older than required.
    #[error("device reports link-layer version {found:#04x}, need at least {required:#04x}")]
    UnsupportedDevice {
        /// Version the peer reported.
        found: u8,
        /// Minimum configured version.
        required: u8,
    },

    /// The peer's version could not be read.
    #[error("could not read remote version: {0}")]
    VersionRead(LinkError),

    /// An RSSI read failed.
    #[error("RSSI read failed: {0}")]
    RssiRead(LinkError),

    /// A disconnect request failed.
    #[error("disconnect failed: {0}")]
    Disconnect(LinkError),

    /// Link encryption could not be established.
    #[error("encryption request failed: {0}")]
    Encryption(LinkError),

    /// The operation needs a connection and there is none.
    #[error("not connected")]
    NotConnected,
}

impl DeviceError {
    /// Returns `true` for failures worth retrying during link setup.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Open { source, .. } | Self::Connection { source, .. } => {
                !matches!(source, LinkError::Rejected(_))
            }
            _ => false,
        }
    }
}

/// Result alias for device operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
