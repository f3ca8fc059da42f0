//! Scripted in-memory [`LinkDriver`] for tests and hardware-free runs.
//!
//! Clones share state, so a test can keep one clone to script failures and
//! inspect the recorded calls after handing the other to a controller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{LinkDriver, LinkError};
use crate::config::RadioParams;
use crate::shutdown::ShutdownTrigger;
use crate::types::{
    ll_version, AddressType, BeaconAddress, ConnectionHandle, DisconnectReason, VersionInfo,
};

/// A driver call, as recorded by [`MockLinkDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `set_whitelist`.
    Whitelist {
        /// Address added.
        address: BeaconAddress,
        /// Its type.
        address_type: AddressType,
    },
    /// `create_connection`.
    Connect {
        /// Parameters passed.
        params: RadioParams,
        /// Request timeout.
        timeout: Duration,
    },
    /// `disconnect_connection`.
    Disconnect {
        /// Handle disconnected.
        handle: ConnectionHandle,
        /// Reason sent.
        reason: DisconnectReason,
    },
    /// `read_rssi`.
    ReadRssi(ConnectionHandle),
    /// `read_remote_version`.
    RemoteVersion(ConnectionHandle),
    /// `request_encryption`.
    Encrypt(ConnectionHandle),
}

#[derive(Debug)]
struct MockState {
    calls: Vec<Call>,
    open_links: usize,
    open_failures: usize,
    whitelist_error: Option<LinkError>,
    connect_failures: VecDeque<LinkError>,
    encrypt_error: Option<LinkError>,
    remote_version: u8,
    rssi: VecDeque<Result<i8, LinkError>>,
    active: Option<ConnectionHandle>,
    next_handle: u16,
    vanish_on_disconnect: bool,
    drained_trigger: Option<ShutdownTrigger>,
}

/// In-memory link driver with scriptable RSSI samples and failures.
#[derive(Debug, Clone)]
pub struct MockLinkDriver {
    state: Arc<Mutex<MockState>>,
}

/// Open link handle of [`MockLinkDriver`].
#[derive(Debug)]
pub struct MockLink {
    _private: (),
}

impl Default for MockLinkDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLinkDriver {
    /// A driver where every request succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                open_links: 0,
                open_failures: 0,
                whitelist_error: None,
                connect_failures: VecDeque::new(),
                encrypt_error: None,
                remote_version: ll_version::CORE_4_2,
                rssi: VecDeque::new(),
                active: None,
                next_handle: 0x0040,
                vanish_on_disconnect: false,
                drained_trigger: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue RSSI samples, returned in order.
    pub fn push_rssi(&self, samples: impl IntoIterator<Item = i8>) {
        self.state().rssi.extend(samples.into_iter().map(Ok));
    }

    /// Queue one failed RSSI read.
    pub fn push_rssi_failure(&self, error: LinkError) {
        self.state().rssi.push_back(Err(error));
    }

    /// Fire `trigger` once the queued RSSI script has been consumed.
    pub fn shutdown_when_drained(&self, trigger: ShutdownTrigger) {
        self.state().drained_trigger = Some(trigger);
    }

    /// Make the next `count` `open_link` calls fail.
    pub fn fail_open(&self, count: usize) {
        self.state().open_failures = count;
    }

    /// Make `set_whitelist` fail.
    pub fn fail_whitelist(&self, error: LinkError) {
        self.state().whitelist_error = Some(error);
    }

    /// Make the next `count` connection attempts fail with `error`.
    pub fn fail_connect(&self, count: usize, error: LinkError) {
        let mut state = self.state();
        for _ in 0..count {
            state.connect_failures.push_back(error.clone());
        }
    }

    /// Make `request_encryption` fail.
    pub fn fail_encryption(&self, error: LinkError) {
        self.state().encrypt_error = Some(error);
    }

    /// Version code reported by `read_remote_version`.
    pub fn set_remote_version(&self, version: u8) {
        self.state().remote_version = version;
    }

    /// Behave as if the peer already dropped the link when disconnecting.
    pub fn drop_connection_on_disconnect(&self) {
        self.state().vanish_on_disconnect = true;
    }

    /// Every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Link handles currently open.
    #[must_use]
    pub fn open_links(&self) -> usize {
        self.state().open_links
    }

    /// Number of `create_connection` calls.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Connect { .. }))
    }

    /// Number of `disconnect_connection` calls.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Disconnect { .. }))
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn check_handle(state: &MockState, handle: ConnectionHandle) -> Result<(), LinkError> {
        if state.active == Some(handle) {
            Ok(())
        } else {
            Err(LinkError::NotConnected(handle))
        }
    }
}

impl LinkDriver for MockLinkDriver {
    type Link = MockLink;

    async fn open_link(&mut self, device_id: &str) -> Result<MockLink, LinkError> {
        let mut state = self.state();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(LinkError::AdapterUnavailable(device_id.to_string()));
        }
        state.open_links += 1;
        Ok(MockLink { _private: () })
    }

    fn close_link(&mut self, _link: MockLink) {
        let mut state = self.state();
        state.open_links = state.open_links.saturating_sub(1);
    }

    async fn set_whitelist(
        &mut self,
        _link: &MockLink,
        address: BeaconAddress,
        address_type: AddressType,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        state.calls.push(Call::Whitelist {
            address,
            address_type,
        });
        state.whitelist_error.clone().map_or(Ok(()), Err)
    }

    async fn create_connection(
        &mut self,
        _link: &MockLink,
        params: &RadioParams,
        _address: BeaconAddress,
        _address_type: AddressType,
        timeout: Duration,
    ) -> Result<ConnectionHandle, LinkError> {
        let mut state = self.state();
        state.calls.push(Call::Connect {
            params: *params,
            timeout,
        });
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        let handle = ConnectionHandle(state.next_handle);
        state.next_handle += 1;
        state.active = Some(handle);
        Ok(handle)
    }

    async fn disconnect_connection(
        &mut self,
        _link: &MockLink,
        handle: ConnectionHandle,
        reason: DisconnectReason,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        state.calls.push(Call::Disconnect { handle, reason });
        if state.vanish_on_disconnect {
            state.active = None;
        }
        Self::check_handle(&state, handle)?;
        state.active = None;
        Ok(())
    }

    async fn read_rssi(
        &mut self,
        _link: &MockLink,
        handle: ConnectionHandle,
        _timeout: Duration,
    ) -> Result<i8, LinkError> {
        let mut state = self.state();
        state.calls.push(Call::ReadRssi(handle));
        Self::check_handle(&state, handle)?;

        let next = state.rssi.pop_front().unwrap_or(Err(LinkError::NoReading));
        if state.rssi.is_empty() {
            if let Some(trigger) = state.drained_trigger.take() {
                trigger.trigger();
            }
        }
        next
    }

    async fn read_remote_version(
        &mut self,
        _link: &MockLink,
        handle: ConnectionHandle,
        _timeout: Duration,
    ) -> Result<VersionInfo, LinkError> {
        let mut state = self.state();
        state.calls.push(Call::RemoteVersion(handle));
        Self::check_handle(&state, handle)?;
        Ok(VersionInfo {
            version: state.remote_version,
            manufacturer: 0x000D,
            subversion: 0,
        })
    }

    async fn request_encryption(
        &mut self,
        _link: &MockLink,
        handle: ConnectionHandle,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        state.calls.push(Call::Encrypt(handle));
        Self::check_handle(&state, handle)?;
        state.encrypt_error.clone().map_or(Ok(()), Err)
    }
}
