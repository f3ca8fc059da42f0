//! Connection lifecycle for the tracked beacon.

use tracing::{debug, info, warn};

use super::{DeviceError, DeviceResult, LinkDriver, LinkError};
use crate::config::{LinkTimeouts, RadioParams};
use crate::types::{BeaconDevice, ConnectionHandle, DisconnectReason, VersionInfo};

/// Where the single beacon connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// A connection request is in flight.
    Connecting,
    /// Connected; the handle is valid.
    Connected {
        /// Controller handle of the connection.
        handle: ConnectionHandle,
    },
}

/// The one connection record the controller owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Local adapter the connection lives on.
    pub dev_id: String,
    /// Current state.
    pub state: ConnectionState,
}

impl Connection {
    /// The handle, if connected.
    #[must_use]
    pub const fn handle(&self) -> Option<ConnectionHandle> {
        match self.state {
            ConnectionState::Connected { handle } => Some(handle),
            ConnectionState::Disconnected | ConnectionState::Connecting => None,
        }
    }
}

/// Owns the connection to the beacon and exposes typed link operations.
///
/// Each operation opens a link handle, performs one bounded request, and
/// closes the handle again on every path.
pub struct DeviceController<D: LinkDriver> {
    driver: D,
    device: BeaconDevice,
    radio: RadioParams,
    timeouts: LinkTimeouts,
    min_version: u8,
    whitelisted: bool,
    connection: Connection,
}

impl<D: LinkDriver> DeviceController<D> {
    /// Create a controller for `device` reached through adapter `dev_id`.
    pub fn new(
        driver: D,
        dev_id: impl Into<String>,
        device: BeaconDevice,
        radio: RadioParams,
        timeouts: LinkTimeouts,
        min_version: u8,
    ) -> Self {
        Self {
            driver,
            device,
            radio,
            timeouts,
            min_version,
            whitelisted: false,
            connection: Connection {
                dev_id: dev_id.into(),
                state: ConnectionState::Disconnected,
            },
        }
    }

    /// The tracked beacon.
    pub const fn device(&self) -> &BeaconDevice {
        &self.device
    }

    /// The connection record.
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the beacon is on the controller's accept list.
    pub const fn is_whitelisted(&self) -> bool {
        self.whitelisted
    }

    /// Whether a connection is established.
    pub const fn is_connected(&self) -> bool {
        self.connection.handle().is_some()
    }

    /// Borrow the driver.
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    async fn open(&mut self) -> DeviceResult<D::Link> {
        self.driver
            .open_link(&self.connection.dev_id)
            .await
            .map_err(|source| DeviceError::Open {
                adapter: self.connection.dev_id.clone(),
                source,
            })
    }

    /// Add the beacon to the controller's accept list.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Open`] or [`DeviceError::Whitelist`].
    pub async fn whitelist(&mut self) -> DeviceResult<()> {
        let link = self.open().await?;
        let result = self
            .driver
            .set_whitelist(
                &link,
                self.device.address,
                self.device.address_type,
                self.timeouts.whitelist,
            )
            .await;
        self.driver.close_link(link);

        result.map_err(|source| DeviceError::Whitelist {
            device: self.device,
            source,
        })?;
        self.whitelisted = true;
        info!(device = %self.device, "Beacon added to whitelist");
        Ok(())
    }

    /// Connect to the beacon. Returns the existing handle if already connected.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Open`] or [`DeviceError::Connection`].
    pub async fn connect(&mut self) -> DeviceResult<ConnectionHandle> {
        if let Some(handle) = self.connection.handle() {
            debug!(%handle, "Already connected");
            return Ok(handle);
        }

        let link = self.open().await?;
        self.connection.state = ConnectionState::Connecting;
        let result = self
            .driver
            .create_connection(
                &link,
                &self.radio,
                self.device.address,
                self.device.address_type,
                self.timeouts.connect,
            )
            .await;
        self.driver.close_link(link);

        match result {
            Ok(handle) => {
                self.connection.state = ConnectionState::Connected { handle };
                info!(device = %self.device, %handle, "Connected to beacon");
                Ok(handle)
            }
            Err(source) => {
                self.connection.state = ConnectionState::Disconnected;
                Err(DeviceError::Connection {
                    device: self.device,
                    source,
                })
            }
        }
    }

    /// Verify the beacon's link layer meets the configured minimum version.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::UnsupportedDevice`] if the version is too old,
    /// [`DeviceError::VersionRead`] if it cannot be read, or
    /// [`DeviceError::NotConnected`].
    pub async fn check_compatibility(&mut self) -> DeviceResult<VersionInfo> {
        let handle = self.connection.handle().ok_or(DeviceError::NotConnected)?;
        let link = self.open().await?;
        let result = self
            .driver
            .read_remote_version(&link, handle, self.timeouts.version)
            .await;
        self.driver.close_link(link);

        let version = result.map_err(DeviceError::VersionRead)?;
        if version.version < self.min_version {
            return Err(DeviceError::UnsupportedDevice {
                found: version.version,
                required: self.min_version,
            });
        }

        info!(
            version = version.version,
            manufacturer = version.manufacturer,
            subversion = version.subversion,
            "Beacon link layer is compatible"
        );
        Ok(version)
    }

    /// Read the connection's RSSI in dBm.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::RssiRead`] or [`DeviceError::NotConnected`].
    pub async fn read_rssi(&mut self) -> DeviceResult<i8> {
        let handle = self.connection.handle().ok_or(DeviceError::NotConnected)?;
        let link = self
            .open()
            .await
            .map_err(|e| match e {
                DeviceError::Open { source, .. } => DeviceError::RssiRead(source),
                other => other,
            })?;
        let result = self
            .driver
            .read_rssi(&link, handle, self.timeouts.rssi)
            .await;
        self.driver.close_link(link);

        result.map_err(DeviceError::RssiRead)
    }

    /// Disconnect from the beacon.
    ///
    /// Succeeds without doing anything when there is no connection, and
    /// treats a connection the driver no longer knows as already closed. The
    /// connection is `Disconnected` afterwards whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Disconnect`] if the driver fails for another reason.
    pub async fn disconnect(&mut self) -> DeviceResult<()> {
        let Some(handle) = self.connection.handle() else {
            debug!("Disconnect requested with no active connection");
            self.connection.state = ConnectionState::Disconnected;
            return Ok(());
        };
        self.connection.state = ConnectionState::Disconnected;

        let link = self.open().await.map_err(|e| match e {
            DeviceError::Open { source, .. } => DeviceError::Disconnect(source),
            other => other,
        })?;
        let result = self
            .driver
            .disconnect_connection(
                &link,
                handle,
                DisconnectReason::RemoteUserTerminated,
                self.timeouts.disconnect,
            )
            .await;
        self.driver.close_link(link);

        match result {
            Ok(()) => {
                info!(%handle, "Disconnected from beacon");
                Ok(())
            }
            Err(LinkError::NotConnected(_)) => {
                debug!(%handle, "Connection was already closed");
                Ok(())
            }
            Err(e) => {
                warn!(%handle, error = %e, "Disconnect request failed");
                Err(DeviceError::Disconnect(e))
            }
        }
    }

    /// Ask for link encryption on the current connection.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Encryption`] or [`DeviceError::NotConnected`].
    pub async fn encrypt(&mut self) -> DeviceResult<()> {
        let handle = self.connection.handle().ok_or(DeviceError::NotConnected)?;
        let link = self.open().await?;
        let result = self
            .driver
            .request_encryption(&link, handle, self.timeouts.encrypt)
            .await;
        self.driver.close_link(link);

        result.map_err(DeviceError::Encryption)?;
        info!(%handle, "Link encrypted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::{Call, MockLinkDriver};
    use crate::types::{ll_version, AddressType, BeaconAddress};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn controller(driver: MockLinkDriver) -> DeviceController<MockLinkDriver> {
        DeviceController::new(
            driver,
            "hci0",
            BeaconDevice {
                address: BeaconAddress::new([0, 7, 0x80, 0x7F, 0x59, 0x9E]),
                address_type: AddressType::Public,
            },
            RadioParams::default(),
            LinkTimeouts::default(),
            ll_version::CORE_4_0,
        )
    }

    #[tokio::test]
    async fn test_setup_sequence() {
        let mut ctl = controller(MockLinkDriver::new());

        assert_ok!(ctl.whitelist().await);
        assert!(ctl.is_whitelisted());

        let handle = assert_ok!(ctl.connect().await);
        assert_eq!(ctl.connection().handle(), Some(handle));

        assert_ok!(ctl.check_compatibility().await);

        let calls = ctl.driver().calls();
        assert!(matches!(calls[0], Call::Whitelist { .. }));
        assert!(matches!(calls[1], Call::Connect { .. }));
        assert!(matches!(calls[2], Call::RemoteVersion(_)));
        assert_eq!(ctl.driver().open_links(), 0);
    }

    #[tokio::test]
    async fn test_connect_passes_radio_parameters() {
        let mut ctl = controller(MockLinkDriver::new());
        assert_ok!(ctl.connect().await);

        match &ctl.driver().calls()[0] {
            Call::Connect { params, timeout, .. } => {
                assert_eq!(params.supervision_timeout, 0x0C80);
                assert!(params.use_whitelist);
                assert_eq!(*timeout, Duration::from_millis(25_000));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_whitelist_failure() {
        let driver = MockLinkDriver::new();
        driver.fail_whitelist(LinkError::Rejected("list full".into()));
        let mut ctl = controller(driver);

        let err = assert_err!(ctl.whitelist().await);
        assert!(matches!(err, DeviceError::Whitelist { .. }));
        assert!(!ctl.is_whitelisted());
        assert_eq!(ctl.driver().open_links(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let driver = MockLinkDriver::new();
        driver.fail_open(1);
        let mut ctl = controller(driver);

        let err = assert_err!(ctl.whitelist().await);
        assert!(matches!(err, DeviceError::Open { ref adapter, .. } if adapter == "hci0"));
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let driver = MockLinkDriver::new();
        driver.fail_connect(1, LinkError::Timeout(Duration::from_secs(25)));
        let mut ctl = controller(driver);

        let err = assert_err!(ctl.connect().await);
        assert!(err.is_transient());
        assert_eq!(ctl.connection().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_reused_when_connected() {
        let mut ctl = controller(MockLinkDriver::new());
        let first = assert_ok!(ctl.connect().await);
        let second = assert_ok!(ctl.connect().await);
        assert_eq!(first, second);
        assert_eq!(ctl.driver().connect_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_version() {
        let driver = MockLinkDriver::new();
        driver.set_remote_version(0x05);
        let mut ctl = controller(driver);
        assert_ok!(ctl.connect().await);

        let err = assert_err!(ctl.check_compatibility().await);
        assert_eq!(
            err,
            DeviceError::UnsupportedDevice {
                found: 0x05,
                required: ll_version::CORE_4_0,
            }
        );
    }

    #[tokio::test]
    async fn test_read_rssi_requires_connection() {
        let mut ctl = controller(MockLinkDriver::new());
        assert_eq!(ctl.read_rssi().await, Err(DeviceError::NotConnected));
    }

    #[tokio::test]
    async fn test_read_rssi_returns_samples() {
        let driver = MockLinkDriver::new();
        driver.push_rssi([-60, -61]);
        let mut ctl = controller(driver);
        assert_ok!(ctl.connect().await);

        assert_eq!(ctl.read_rssi().await, Ok(-60));
        assert_eq!(ctl.read_rssi().await, Ok(-61));
    }

    #[tokio::test]
    async fn test_read_rssi_failure() {
        let driver = MockLinkDriver::new();
        driver.push_rssi_failure(LinkError::Timeout(Duration::from_secs(1)));
        let mut ctl = controller(driver);
        assert_ok!(ctl.connect().await);

        let err = assert_err!(ctl.read_rssi().await);
        assert!(matches!(err, DeviceError::RssiRead(LinkError::Timeout(_))));
        assert_eq!(ctl.driver().open_links(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_ok() {
        let mut ctl = controller(MockLinkDriver::new());
        assert_ok!(ctl.connect().await);

        assert_ok!(ctl.disconnect().await);
        assert_ok!(ctl.disconnect().await);
        assert_eq!(ctl.driver().disconnect_count(), 1);
        assert!(!ctl.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_ok() {
        let mut ctl = controller(MockLinkDriver::new());
        assert_ok!(ctl.disconnect().await);
        assert_eq!(ctl.driver().disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_of_vanished_connection_is_ok() {
        let driver = MockLinkDriver::new();
        driver.drop_connection_on_disconnect();
        let mut ctl = controller(driver);
        assert_ok!(ctl.connect().await);

        assert_ok!(ctl.disconnect().await);
        assert!(!ctl.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_uses_user_ended_reason() {
        let mut ctl = controller(MockLinkDriver::new());
        let handle = assert_ok!(ctl.connect().await);
        assert_ok!(ctl.disconnect().await);

        let calls = ctl.driver().calls();
        assert_eq!(
            calls.last(),
            Some(&Call::Disconnect {
                handle,
                reason: DisconnectReason::RemoteUserTerminated,
            })
        );
    }

    #[tokio::test]
    async fn test_encrypt() {
        let mut ctl = controller(MockLinkDriver::new());
        assert_eq!(ctl.encrypt().await, Err(DeviceError::NotConnected));

        assert_ok!(ctl.connect().await);
        assert_ok!(ctl.encrypt().await);
    }
}
