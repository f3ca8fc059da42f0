//! [`LinkDriver`] backed by BlueZ over D-Bus.
//!
//! bluetoothd owns the radio, so a few primitives map loosely:
//!
//! - Connection parameters are chosen by the kernel controller; the
//!   configured [`RadioParams`] are logged but not applied.
//! - The whitelist is bluetoothd's trusted-device list.
//! - BlueZ does not expose the peer's LMP/LL version. An established LE
//!   connection implies at least Core 4.0, which is what
//!   `read_remote_version` reports.
//! - RSSI comes from the device's `RSSI` property. bluetoothd only refreshes
//!   it from advertisements seen during discovery, so the driver keeps an LE
//!   discovery session open and a per-connection task records every change.
//!   A read returns the latest value only while the link is up and the value
//!   is at most [`RSSI_MAX_AGE`] old; otherwise [`LinkError::NoReading`] or
//!   [`LinkError::NotConnected`]. A beacon that stops advertising while
//!   connected therefore ends up `Lost`, never stuck on a cached value.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bluer::{
    Adapter, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport,
    ErrorKind, Session,
};
use futures::{pin_mut, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::sample::LatestSample;
use super::{LinkDriver, LinkError};
use crate::config::RadioParams;
use crate::types::{
    ll_version, AddressType, BeaconAddress, ConnectionHandle, DisconnectReason, VersionInfo,
};

/// Manufacturer code reported when the peer advertises none.
const UNKNOWN_MANUFACTURER: u16 = 0xFFFF;

/// Oldest RSSI value a read may return.
pub const RSSI_MAX_AGE: Duration = Duration::from_secs(3);

/// A connected beacon and the task feeding its RSSI.
struct Tracked {
    device: Device,
    rssi: LatestSample,
    watcher: JoinHandle<()>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Drives the local controller through bluetoothd.
#[derive(Default)]
pub struct BluezDriver {
    session: Option<Session>,
    discovery: Option<JoinHandle<()>>,
    connections: HashMap<ConnectionHandle, Tracked>,
    next_handle: u16,
}

impl Drop for BluezDriver {
    fn drop(&mut self) {
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }
    }
}

impl BluezDriver {
    /// Create a driver; the D-Bus session is opened on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn session(&mut self) -> Result<&Session, LinkError> {
        if self.session.is_none() {
            let session = Session::new().await.map_err(rejected)?;
            self.session = Some(session);
        }
        self.session
            .as_ref()
            .ok_or_else(|| LinkError::Rejected("bluetoothd session unavailable".into()))
    }

    fn tracked(&self, handle: ConnectionHandle) -> Result<&Tracked, LinkError> {
        self.connections
            .get(&handle)
            .ok_or(LinkError::NotConnected(handle))
    }

    async fn track(
        &mut self,
        device: Device,
        timeout: Duration,
    ) -> Result<ConnectionHandle, LinkError> {
        let rssi = LatestSample::new();
        let watcher = watch_rssi(&device, rssi.clone(), timeout).await?;

        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = ConnectionHandle(self.next_handle);
        self.connections.insert(
            handle,
            Tracked {
                device,
                rssi,
                watcher,
            },
        );
        Ok(handle)
    }

    async fn ensure_connected(
        &self,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Result<&Tracked, LinkError> {
        let tracked = self.tracked(handle)?;
        if bounded(timeout, tracked.device.is_connected()).await? {
            Ok(tracked)
        } else {
            tracked.rssi.clear();
            Err(LinkError::NotConnected(handle))
        }
    }

    /// Keep an LE discovery session open so bluetoothd keeps refreshing RSSI.
    async fn start_discovery(
        &mut self,
        adapter: &Adapter,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        if self.discovery.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..DiscoveryFilter::default()
        };
        bounded(timeout, adapter.set_discovery_filter(filter)).await?;
        let events = bounded(timeout, adapter.discover_devices()).await?;

        let name = adapter.name().to_string();
        info!(adapter = %name, "LE discovery started");
        self.discovery = Some(tokio::spawn(async move {
            pin_mut!(events);
            while events.next().await.is_some() {}
            warn!(adapter = %name, "LE discovery ended");
        }));
        Ok(())
    }
}

/// Spawn a task copying `device`'s RSSI property changes into `sample`.
async fn watch_rssi(
    device: &Device,
    sample: LatestSample,
    timeout: Duration,
) -> Result<JoinHandle<()>, LinkError> {
    let events = bounded(timeout, device.events()).await?;
    let address = device.address();

    Ok(tokio::spawn(async move {
        pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Rssi(rssi)) => sample.record(rssi),
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                    debug!(%address, "Beacon reported disconnected");
                    sample.clear();
                }
                _ => {}
            }
        }
        debug!(%address, "Device event stream ended");
    }))
}

fn address(address: BeaconAddress) -> Address {
    Address::new(address.octets())
}

const fn address_type(address_type: AddressType) -> bluer::AddressType {
    match address_type {
        AddressType::Public => bluer::AddressType::LePublic,
        AddressType::Random => bluer::AddressType::LeRandom,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn rejected(e: bluer::Error) -> LinkError {
    LinkError::Rejected(e.to_string())
}

/// Await a bluer call for at most `timeout`.
async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = bluer::Result<T>> + Send,
) -> Result<T, LinkError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| LinkError::Timeout(timeout))?
        .map_err(rejected)
}

impl LinkDriver for BluezDriver {
    type Link = Adapter;

    async fn open_link(&mut self, device_id: &str) -> Result<Adapter, LinkError> {
        let adapter = self
            .session()
            .await?
            .adapter(device_id)
            .map_err(|_| LinkError::AdapterUnavailable(device_id.to_string()))?;

        match adapter.is_powered().await {
            Ok(true) => Ok(adapter),
            Ok(false) => {
                warn!(adapter = device_id, "Adapter is powered off");
                Err(LinkError::AdapterUnavailable(device_id.to_string()))
            }
            Err(e) => {
                debug!(adapter = device_id, error = %e, "Adapter query failed");
                Err(LinkError::AdapterUnavailable(device_id.to_string()))
            }
        }
    }

    fn close_link(&mut self, _link: Adapter) {}

    async fn set_whitelist(
        &mut self,
        link: &Adapter,
        addr: BeaconAddress,
        _address_type: AddressType,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let device = link.device(address(addr)).map_err(rejected)?;
        bounded(timeout, device.set_trusted(true)).await?;
        debug!(address = %addr, "Marked beacon as trusted");
        Ok(())
    }

    async fn create_connection(
        &mut self,
        link: &Adapter,
        params: &RadioParams,
        addr: BeaconAddress,
        kind: AddressType,
        timeout: Duration,
    ) -> Result<ConnectionHandle, LinkError> {
        debug!(
            conn_interval_min = params.conn_interval_min,
            conn_interval_max = params.conn_interval_max,
            supervision_timeout = params.supervision_timeout,
            "Connection parameters are managed by the controller"
        );

        if let Err(e) = self.start_discovery(link, timeout).await {
            warn!(error = %e, "Could not start LE discovery; RSSI may not refresh");
        }

        let target = address(addr);
        let device = match bounded(timeout, link.connect_device(target, address_type(kind))).await
        {
            Ok(device) => device,
            Err(LinkError::Rejected(reason)) => {
                // connect_device refuses devices bluetoothd already knows.
                let known = bounded(timeout, link.device_addresses()).await?;
                if !known.contains(&target) {
                    return Err(LinkError::Rejected(reason));
                }
                let device = link.device(target).map_err(rejected)?;
                bounded(timeout, device.connect()).await?;
                device
            }
            Err(e) => return Err(e),
        };

        let handle = self.track(device, timeout).await?;
        info!(address = %addr, %handle, "LE connection established");
        Ok(handle)
    }

    async fn disconnect_connection(
        &mut self,
        _link: &Adapter,
        handle: ConnectionHandle,
        reason: DisconnectReason,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let tracked = self
            .connections
            .remove(&handle)
            .ok_or(LinkError::NotConnected(handle))?;

        match tokio::time::timeout(timeout, tracked.device.disconnect()).await {
            Ok(Ok(())) => {
                debug!(%handle, reason = reason.code(), "Disconnect requested");
                Ok(())
            }
            Ok(Err(e)) if matches!(e.kind, ErrorKind::NotConnected) => {
                Err(LinkError::NotConnected(handle))
            }
            Ok(Err(e)) => Err(rejected(e)),
            Err(_) => Err(LinkError::Timeout(timeout)),
        }
    }

    async fn read_rssi(
        &mut self,
        _link: &Adapter,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Result<i8, LinkError> {
        self.ensure_connected(handle, timeout)
            .await?
            .rssi
            .fresh(RSSI_MAX_AGE)
    }

    async fn read_remote_version(
        &mut self,
        _link: &Adapter,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Result<VersionInfo, LinkError> {
        let device = &self.ensure_connected(handle, timeout).await?.device;
        let manufacturer = bounded(timeout, device.manufacturer_data())
            .await?
            .and_then(|data| data.keys().min().copied())
            .unwrap_or(UNKNOWN_MANUFACTURER);

        Ok(VersionInfo {
            version: ll_version::CORE_4_0,
            manufacturer,
            subversion: 0,
        })
    }

    async fn request_encryption(
        &mut self,
        _link: &Adapter,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let device = &self.ensure_connected(handle, timeout).await?.device;
        if bounded(timeout, device.is_paired()).await? {
            debug!(%handle, "Beacon already paired");
            return Ok(());
        }
        bounded(timeout, device.pair()).await
    }
}
