//! Process lifecycle: link setup, monitoring, teardown.
//!
//! [`Supervisor::run`] consumes the supervisor, so teardown happens exactly
//! once on every exit path. Teardown releases display locks only while the
//! beacon is present; otherwise the lockers are detached and outlive the
//! process. The link is disconnected last.

use tracing::{error, info, warn};

use crate::config::{Config, ConfigResult, LinkTimeouts, SetupConfig};
use crate::distance::DistanceModel;
use crate::error::Result;
use crate::link::{DeviceController, DeviceResult, LinkDriver};
use crate::lock::{LockController, LockSurface};
use crate::monitor::{MonitorSummary, ProximityMonitor, ProximityState};
use crate::shutdown::Shutdown;
use crate::types::VersionInfo;

/// What a completed run did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    /// Remote version seen during setup; `None` if shutdown came first.
    pub version: Option<VersionInfo>,
    /// Whether link encryption was established.
    pub encrypted: bool,
    /// Monitor loop counters.
    pub monitor: MonitorSummary,
    /// Presence state when the loop stopped.
    pub final_state: Option<ProximityState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupStep {
    Whitelist,
    Connect,
}

impl SetupStep {
    const fn name(self) -> &'static str {
        match self {
            Self::Whitelist => "whitelist",
            Self::Connect => "connect",
        }
    }
}

struct Established {
    version: VersionInfo,
    encrypted: bool,
}

/// Owns the device, lock and monitor for one daemon run.
pub struct Supervisor<D: LinkDriver, S: LockSurface> {
    device: DeviceController<D>,
    locks: LockController<S>,
    monitor: ProximityMonitor,
    setup: SetupConfig,
    encrypt: bool,
}

impl<D: LinkDriver, S: LockSurface> Supervisor<D, S> {
    /// Wire up the components described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the beacon address is malformed.
    pub fn new(driver: D, surface: S, config: &Config) -> ConfigResult<Self> {
        let device = DeviceController::new(
            driver,
            config.device.adapter.clone(),
            config.beacon()?,
            config.radio,
            LinkTimeouts::from(config.timeouts),
            config.device.min_link_layer_version,
        );
        let monitor = ProximityMonitor::new(
            &config.proximity,
            DistanceModel::from(config.calibration),
        );

        Ok(Self {
            device,
            locks: LockController::new(surface),
            monitor,
            setup: config.setup,
            encrypt: config.device.encrypt,
        })
    }

    /// Set up the link, monitor until shutdown, then tear down.
    ///
    /// A shutdown request during setup ends the run cleanly with an empty
    /// summary.
    ///
    /// # Errors
    ///
    /// Returns the setup failure, after teardown has run.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<RunSummary> {
        info!(device = %self.device.device(), "Supervisor starting");

        let result = match self.establish(&mut shutdown).await {
            Ok(Some(established)) => {
                let monitor = self
                    .monitor
                    .run(&mut self.device, &mut self.locks, &mut shutdown)
                    .await;
                Ok(RunSummary {
                    version: Some(established.version),
                    encrypted: established.encrypted,
                    monitor,
                    final_state: Some(self.monitor.state()),
                })
            }
            Ok(None) => {
                info!("Shutdown requested during setup");
                Ok(RunSummary::default())
            }
            Err(e) => {
                error!(
                    error = %e,
                    code = e.error_code(),
                    recoverable = e.is_recoverable(),
                    "Link setup failed"
                );
                Err(e)
            }
        };

        self.teardown().await;
        result
    }

    async fn establish(&mut self, shutdown: &mut Shutdown) -> Result<Option<Established>> {
        if shutdown.is_requested() {
            return Ok(None);
        }
        for step in [SetupStep::Whitelist, SetupStep::Connect] {
            if !self.with_retry(step, shutdown).await? {
                return Ok(None);
            }
        }
        let version = self.device.check_compatibility().await?;

        let encrypted = if self.encrypt {
            match self.device.encrypt().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Continuing without link encryption");
                    false
                }
            }
        } else {
            false
        };

        Ok(Some(Established { version, encrypted }))
    }

    async fn attempt(&mut self, step: SetupStep) -> DeviceResult<()> {
        match step {
            SetupStep::Whitelist => self.device.whitelist().await,
            SetupStep::Connect => self.device.connect().await.map(drop),
        }
    }

    /// Run one setup step, retrying transient failures with exponential
    /// backoff.
    ///
    /// Returns `false` if shutdown interrupts the attempts.
    async fn with_retry(
        &mut self,
        step: SetupStep,
        shutdown: &mut Shutdown,
    ) -> DeviceResult<bool> {
        let attempts = self.setup.attempts.max(1);
        let mut attempt = 1;
        loop {
            if shutdown.is_requested() {
                return Ok(false);
            }
            match self.attempt(step).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.setup.backoff(attempt);
                    warn!(
                        step = step.name(),
                        error = %e,
                        attempt,
                        attempts,
                        retry_in_ms = delay.as_millis(),
                        "Setup step failed"
                    );
                    if shutdown.sleep(delay).await {
                        return Ok(false);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn teardown(&mut self) {
        let state = self.monitor.state();
        if state.wants_lock() {
            if self.locks.is_locked() {
                let kept = self.locks.detach();
                warn!(%state, kept, "Beacon away at shutdown, displays stay locked");
            }
        } else {
            let report = self.locks.unlock().await;
            if !report.failed.is_empty() {
                error!(
                    failed = report.failed.len(),
                    "Some displays did not unlock during shutdown"
                );
            }
        }
        if let Err(e) = self.device.disconnect().await {
            error!(error = %e, "Disconnect during shutdown failed");
        }
        info!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BeaconLockError;
    use crate::link::mock::{Call, MockLinkDriver};
    use crate::link::{DeviceError, LinkError};
    use crate::lock::mock::MockSurface;
    use crate::shutdown;
    use crate::types::SurfaceId;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn config() -> Config {
        let mut config = Config::default();
        config.proximity.poll_interval_ms = 1;
        config.setup.backoff_ms = 1;
        config
    }

    fn surface() -> MockSurface {
        MockSurface::new(vec![SurfaceId::new(":0")])
    }

    #[test]
    fn test_new_rejects_bad_address() {
        let mut config = config();
        config.device.address = "not-an-address".into();
        assert!(Supervisor::new(MockLinkDriver::new(), surface(), &config).is_err());
    }

    #[tokio::test]
    async fn test_full_run_keeps_lock_and_disconnects_once() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.push_rssi([-50, -72, -74]);
        driver.shutdown_when_drained(trigger);
        let provider = surface();
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), provider.clone(), &config()));

        let summary = assert_ok!(supervisor.run(shutdown).await);

        assert_eq!(summary.monitor.cycles, 3);
        assert_eq!(summary.monitor.transitions, 1);
        assert_eq!(summary.final_state, Some(ProximityState::Absent));
        assert!(summary.version.is_some());
        assert_eq!(provider.acquire_count(), 1);
        assert_eq!(provider.release_count(), 0);
        assert_eq!(provider.detach_count(), 1);
        assert_eq!(provider.held(), 1);
        assert_eq!(driver.disconnect_count(), 1);
        assert_eq!(driver.open_links(), 0);
    }

    #[tokio::test]
    async fn test_setup_order() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.push_rssi([-50]);
        driver.shutdown_when_drained(trigger);
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        assert_ok!(supervisor.run(shutdown).await);

        let calls = driver.calls();
        assert!(matches!(calls[0], Call::Whitelist { .. }));
        assert!(matches!(calls[1], Call::Connect { .. }));
        assert!(matches!(calls[2], Call::RemoteVersion(_)));
        assert!(matches!(calls.last(), Some(Call::Disconnect { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_device_still_disconnects_once() {
        let (_trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.set_remote_version(5);
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        let err = assert_err!(supervisor.run(shutdown).await);

        assert_eq!(err.exit_code(), crate::error::EXIT_SETUP_FAILURE);
        assert!(matches!(
            err,
            BeaconLockError::Device(DeviceError::UnsupportedDevice { found: 5, required: 6 })
        ));
        assert_eq!(driver.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_whitelist_failure_is_fatal() {
        let (_trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_whitelist(LinkError::Rejected("command disallowed".into()));
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        let err = assert_err!(supervisor.run(shutdown).await);

        assert_eq!(err.error_code(), "DEVICE_WHITELIST");
        assert_eq!(driver.connect_count(), 0);
        assert_eq!(driver.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_retries_are_bounded() {
        let (_trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_connect(10, LinkError::Timeout(Duration::from_secs(25)));
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        let err = assert_err!(supervisor.run(shutdown).await);

        assert_eq!(err.error_code(), "DEVICE_CONNECTION");
        assert_eq!(driver.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_connect_recovers_after_transient_failures() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_connect(2, LinkError::Timeout(Duration::from_secs(25)));
        driver.push_rssi([-50]);
        driver.shutdown_when_drained(trigger);
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        assert_ok!(supervisor.run(shutdown).await);
        assert_eq!(driver.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_rejected_connection_is_not_retried() {
        let (_trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_connect(1, LinkError::Rejected("unknown peer".into()));
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        assert_err!(supervisor.run(shutdown).await);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_setup() {
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();
        let driver = MockLinkDriver::new();
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        let summary = assert_ok!(supervisor.run(shutdown).await);

        assert_eq!(summary, RunSummary::default());
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_connect(1, LinkError::Timeout(Duration::from_secs(25)));
        let mut config = config();
        config.setup.backoff_ms = 3_600_000;
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });
        let summary = assert_ok!(supervisor.run(shutdown).await);

        assert_eq!(summary.monitor.cycles, 0);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_encryption_failure_is_not_fatal() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_encryption(LinkError::Rejected("pairing not supported".into()));
        driver.push_rssi([-50]);
        driver.shutdown_when_drained(trigger);
        let mut config = config();
        config.device.encrypt = true;
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config));

        let summary = assert_ok!(supervisor.run(shutdown).await);

        assert!(!summary.encrypted);
        assert_eq!(summary.monitor.cycles, 1);
        assert!(driver.calls().iter().any(|c| matches!(c, Call::Encrypt(_))));
    }

    #[tokio::test]
    async fn test_lost_beacon_keeps_displays_locked_on_shutdown() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        for _ in 0..5 {
            driver.push_rssi_failure(LinkError::NoReading);
        }
        driver.shutdown_when_drained(trigger);
        let provider = surface();
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), provider.clone(), &config()));

        let summary = assert_ok!(supervisor.run(shutdown).await);

        assert_eq!(summary.final_state, Some(ProximityState::Lost));
        assert_eq!(provider.acquire_count(), 1);
        assert_eq!(provider.release_count(), 0);
        assert_eq!(provider.held(), 1);
        // The Lost transition already dropped the link.
        assert_eq!(driver.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_present_beacon_unlocks_on_shutdown() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.push_rssi([-72, -74, -50]);
        driver.shutdown_when_drained(trigger);
        let provider = surface();
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), provider.clone(), &config()));

        let summary = assert_ok!(supervisor.run(shutdown).await);

        assert_eq!(summary.final_state, Some(ProximityState::Present));
        assert_eq!(provider.held(), 0);
        assert_eq!(provider.detach_count(), 0);
    }

    #[tokio::test]
    async fn test_adapter_open_is_retried() {
        let (trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_open(1);
        driver.push_rssi([-50]);
        driver.shutdown_when_drained(trigger);
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        let summary = assert_ok!(supervisor.run(shutdown).await);

        assert_eq!(summary.monitor.cycles, 1);
        let whitelists = driver
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Whitelist { .. }))
            .count();
        assert_eq!(whitelists, 1);
    }

    #[tokio::test]
    async fn test_adapter_open_retries_are_bounded() {
        let (_trigger, shutdown) = shutdown::channel();
        let driver = MockLinkDriver::new();
        driver.fail_open(10);
        let supervisor = assert_ok!(Supervisor::new(driver.clone(), surface(), &config()));

        let err = assert_err!(supervisor.run(shutdown).await);

        assert_eq!(err.error_code(), "DEVICE_OPEN");
        assert!(err.is_recoverable());
        assert_eq!(driver.connect_count(), 0);
    }
}
