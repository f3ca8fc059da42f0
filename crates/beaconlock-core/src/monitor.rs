//! Proximity decision state machine.
//!
//! The monitor keeps one [`ProximityState`] and updates it from RSSI samples
//! with hysteresis: leaving needs a far distance estimate *and* a sample in
//! the departure band, returning needs a near estimate *and* a sample in the
//! arrival band. The bands gate out single noisy readings near a threshold.
//!
//! Failed reads are counted; enough of them in a row mark the beacon
//! [`ProximityState::Lost`], which locks like `Absent` does.
//!
//! The decision step ([`ProximityMonitor::observe`],
//! [`ProximityMonitor::record_read_failure`]) is synchronous and pure; the
//! polling loop around it is [`ProximityMonitor::run`].

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{ProximityConfig, RssiBand};
use crate::distance::{DistanceModel, NO_SIGNAL};
use crate::link::{DeviceController, LinkDriver};
use crate::lock::{Coverage, LockController, LockSurface};
use crate::shutdown::Shutdown;

/// Whether the beacon is judged to be with the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProximityState {
    /// Near the host; displays unlocked.
    #[default]
    Present,
    /// Readable but away; displays locked.
    Absent,
    /// Unreadable; displays locked until the beacon is heard again.
    Lost,
}

impl ProximityState {
    /// Whether displays should be locked in this state.
    #[must_use]
    pub const fn wants_lock(self) -> bool {
        !matches!(self, Self::Present)
    }
}

impl fmt::Display for ProximityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present => write!(f, "present"),
            Self::Absent => write!(f, "absent"),
            Self::Lost => write!(f, "lost"),
        }
    }
}

/// What a transition asks of the lock controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockIntent {
    /// Lock every display.
    Lock,
    /// Release every display.
    Unlock,
}

/// A change of [`ProximityState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// State before.
    pub from: ProximityState,
    /// State after.
    pub to: ProximityState,
    /// Sample that caused it, if any.
    pub rssi: Option<i8>,
    /// Distance estimate for that sample.
    pub distance: Option<f64>,
}

impl Transition {
    /// The lock action this transition calls for.
    #[must_use]
    pub const fn intent(&self) -> Option<LockIntent> {
        match (self.from.wants_lock(), self.to.wants_lock()) {
            (false, true) => Some(LockIntent::Lock),
            (true, false) => Some(LockIntent::Unlock),
            _ => None,
        }
    }
}

/// Thresholds for leaving and returning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hysteresis {
    /// Distance at or beyond which the beacon has left.
    pub departure_distance: f64,
    /// Band a departure sample must fall in.
    pub departure_band: RssiBand,
    /// Distance at or within which the beacon has returned.
    pub arrival_distance: f64,
    /// Band an arrival sample must fall in.
    pub arrival_band: RssiBand,
}

impl Hysteresis {
    fn departs(&self, rssi: i8, distance: f64) -> bool {
        distance >= self.departure_distance && self.departure_band.contains(rssi)
    }

    fn arrives(&self, rssi: i8, distance: f64) -> bool {
        distance <= self.arrival_distance && self.arrival_band.contains(rssi)
    }
}

impl From<&ProximityConfig> for Hysteresis {
    fn from(c: &ProximityConfig) -> Self {
        Self {
            departure_distance: c.departure_distance,
            departure_band: c.departure_band,
            arrival_distance: c.arrival_distance,
            arrival_band: c.arrival_band,
        }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Poll cycles run.
    pub cycles: u64,
    /// State changes.
    pub transitions: u64,
    /// Failed RSSI reads.
    pub read_failures: u64,
}

/// Presence state machine and polling loop.
#[derive(Debug, Clone)]
pub struct ProximityMonitor {
    state: ProximityState,
    hysteresis: Hysteresis,
    model: DistanceModel,
    poll_interval: Duration,
    max_read_failures: u32,
    consecutive_failures: u32,
}

impl ProximityMonitor {
    /// Create a monitor starting in [`ProximityState::Present`].
    #[must_use]
    pub fn new(config: &ProximityConfig, model: DistanceModel) -> Self {
        Self {
            state: ProximityState::Present,
            hysteresis: Hysteresis::from(config),
            model,
            poll_interval: config.poll_interval(),
            max_read_failures: config.max_consecutive_read_failures.max(1),
            consecutive_failures: 0,
        }
    }

    /// Start in `state` instead of `Present`.
    #[must_use]
    pub const fn with_state(mut self, state: ProximityState) -> Self {
        self.state = state;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ProximityState {
        self.state
    }

    /// Failed reads since the last good sample.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Apply one RSSI sample.
    ///
    /// A reading of exactly 0 dBm means the controller had no measurement
    /// and counts as a failed read.
    pub fn observe(&mut self, rssi: i8) -> Option<Transition> {
        if rssi == NO_SIGNAL {
            return self.record_read_failure();
        }
        self.consecutive_failures = 0;
        let distance = self.model.estimate(rssi);
        debug!(rssi, distance, state = %self.state, "Sample");

        let next = match self.state {
            ProximityState::Present if self.hysteresis.departs(rssi, distance) => {
                ProximityState::Absent
            }
            ProximityState::Absent | ProximityState::Lost
                if self.hysteresis.arrives(rssi, distance) =>
            {
                ProximityState::Present
            }
            ProximityState::Lost => ProximityState::Absent,
            current => current,
        };

        self.transition_to(next, Some(rssi), Some(distance))
    }

    /// Count one failed read; returns a transition to `Lost` once the limit is reached.
    pub fn record_read_failure(&mut self) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.max_read_failures {
            self.transition_to(ProximityState::Lost, None, None)
        } else {
            None
        }
    }

    fn transition_to(
        &mut self,
        next: ProximityState,
        rssi: Option<i8>,
        distance: Option<f64>,
    ) -> Option<Transition> {
        if next == self.state {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to: next,
            rssi,
            distance,
        };
        self.state = next;
        info!(
            from = %transition.from,
            to = %transition.to,
            rssi = ?rssi,
            distance = ?distance,
            "Proximity changed"
        );
        Some(transition)
    }

    /// Poll until shutdown is requested.
    ///
    /// Shutdown is checked at the top of each cycle and interrupts the sleep
    /// between cycles; an in-flight link request always runs to completion.
    pub async fn run<D, S>(
        &mut self,
        device: &mut DeviceController<D>,
        locks: &mut LockController<S>,
        shutdown: &mut Shutdown,
    ) -> MonitorSummary
    where
        D: LinkDriver,
        S: LockSurface,
    {
        let mut summary = MonitorSummary::default();
        info!(
            state = %self.state,
            interval_ms = self.poll_interval.as_millis(),
            "Proximity monitor started"
        );

        loop {
            if shutdown.is_requested() {
                break;
            }
            self.cycle(device, locks, &mut summary).await;
            if shutdown.sleep(self.poll_interval).await {
                break;
            }
        }

        info!(
            cycles = summary.cycles,
            transitions = summary.transitions,
            read_failures = summary.read_failures,
            "Proximity monitor stopped"
        );
        summary
    }

    /// Run one poll cycle: reap, reconnect if lost, sample, act.
    pub async fn cycle<D, S>(
        &mut self,
        device: &mut DeviceController<D>,
        locks: &mut LockController<S>,
        summary: &mut MonitorSummary,
    ) where
        D: LinkDriver,
        S: LockSurface,
    {
        summary.cycles += 1;
        locks.reap();

        if self.state == ProximityState::Lost && !device.is_connected() {
            if let Err(e) = device.connect().await {
                debug!(error = %e, "Beacon still unreachable");
                self.ensure_locked(locks).await;
                return;
            }
        }

        let transition = match device.read_rssi().await {
            Ok(rssi) if rssi != NO_SIGNAL => self.observe(rssi),
            result => {
                summary.read_failures += 1;
                let consecutive = self.consecutive_failures.saturating_add(1);
                match result {
                    Err(e) => warn!(
                        error = %e,
                        consecutive,
                        limit = self.max_read_failures,
                        "RSSI read failed"
                    ),
                    Ok(_) => warn!(
                        consecutive,
                        limit = self.max_read_failures,
                        "RSSI read returned no measurement"
                    ),
                }
                self.record_read_failure()
            }
        };

        if let Some(transition) = transition {
            summary.transitions += 1;
            if transition.to == ProximityState::Lost {
                // Drop the stale link; the next cycle reconnects.
                if let Err(e) = device.disconnect().await {
                    warn!(error = %e, "Could not drop stale link");
                }
            }
            if transition.intent() == Some(LockIntent::Unlock) {
                let report = locks.unlock().await;
                if !report.failed.is_empty() {
                    error!(
                        failed = report.failed.len(),
                        "Some displays did not unlock cleanly"
                    );
                }
            }
        }

        // Covers a fresh Lock intent as well as surfaces missing since an
        // earlier cycle.
        if self.state.wants_lock() {
            self.ensure_locked(locks).await;
        }
    }

    async fn ensure_locked<S: LockSurface>(&self, locks: &mut LockController<S>) {
        if locks.is_fully_locked() {
            return;
        }
        let report = locks.lock().await;
        match report.coverage() {
            Coverage::Full => {}
            Coverage::Partial => warn!(
                held = report.held,
                surfaces = report.surfaces,
                "Displays only partially locked"
            ),
            Coverage::Nothing => error!(surfaces = report.surfaces, "No display could be locked"),
        }
    }
}
