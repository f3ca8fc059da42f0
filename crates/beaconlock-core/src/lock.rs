//! Screen locking.
//!
//! [`LockController`] turns lock/unlock intents into one lock handle per
//! display surface, obtained from a [`LockSurface`] provider. Acquisition is
//! best effort across surfaces: a failure on one display never stops the
//! others from being locked, and the per-surface outcome is reported back.

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::SurfaceId;

pub mod command;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

pub use command::CommandSurface;

/// Failure to lock or unlock one surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The surface could not be locked.
    #[error("failed to lock {surface}: {reason}")]
    Acquire {
        /// Surface that stayed unlocked.
        surface: SurfaceId,
        /// What went wrong.
        reason: String,
    },

    /// A held lock could not be released cleanly.
    #[error("failed to unlock {surface}: {reason}")]
    Release {
        /// Surface whose lock was being released.
        surface: SurfaceId,
        /// What went wrong.
        reason: String,
    },
}

impl LockError {
    /// The surface the error concerns.
    #[must_use]
    pub const fn surface(&self) -> &SurfaceId {
        match self {
            Self::Acquire { surface, .. } | Self::Release { surface, .. } => surface,
        }
    }
}

/// Provider of per-surface locks.
pub trait LockSurface: Send {
    /// Opaque proof that one surface is locked.
    type Handle: Send;

    /// Surfaces currently known to the provider.
    fn surfaces(&self) -> Vec<SurfaceId>;

    /// Lock one surface.
    fn acquire(
        &mut self,
        surface: &SurfaceId,
    ) -> impl Future<Output = Result<Self::Handle, LockError>> + Send;

    /// Release a lock. The handle is consumed even when release fails.
    fn release(
        &mut self,
        handle: Self::Handle,
    ) -> impl Future<Output = Result<(), LockError>> + Send;

    /// Non-blocking check that a handle still locks its surface.
    fn is_held(&mut self, _handle: &mut Self::Handle) -> bool {
        true
    }

    /// Give up ownership of a handle while leaving its surface locked.
    fn detach(&mut self, handle: Self::Handle) {
        drop(handle);
    }
}

/// How much of the display set a lock attempt covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Every surface is locked.
    Full,
    /// Some surfaces are locked.
    Partial,
    /// No surface is locked.
    Nothing,
}

/// Outcome of [`LockController::lock`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockReport {
    /// Surfaces locked by this call.
    pub acquired: Vec<SurfaceId>,
    /// Surfaces that could not be locked by this call.
    pub failed: Vec<LockError>,
    /// Handles held after the call.
    pub held: usize,
    /// Surfaces in the session.
    pub surfaces: usize,
}

impl LockReport {
    /// Coverage after the call.
    #[must_use]
    pub const fn coverage(&self) -> Coverage {
        if self.held == 0 {
            Coverage::Nothing
        } else if self.held == self.surfaces {
            Coverage::Full
        } else {
            Coverage::Partial
        }
    }

    /// Returns `true` if the call found everything already locked.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.acquired.is_empty() && self.failed.is_empty()
    }
}

/// Outcome of [`LockController::unlock`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockReport {
    /// Surfaces released cleanly.
    pub released: Vec<SurfaceId>,
    /// Releases that reported an error; the handle is gone regardless.
    pub failed: Vec<LockError>,
}

impl UnlockReport {
    /// Returns `true` if there was no session to release.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.released.is_empty() && self.failed.is_empty()
    }
}

/// The set of locks held while the beacon is away.
#[derive(Debug)]
pub struct LockSession<H> {
    surfaces: Vec<SurfaceId>,
    handles: Vec<(SurfaceId, H)>,
    started_at: DateTime<Utc>,
}

impl<H> LockSession<H> {
    fn new(surfaces: Vec<SurfaceId>) -> Self {
        Self {
            surfaces,
            handles: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Surfaces known when the session began.
    #[must_use]
    pub fn surfaces(&self) -> &[SurfaceId] {
        &self.surfaces
    }

    /// Number of handles held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.handles.len()
    }

    /// When the session began.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn is_held(&self, surface: &SurfaceId) -> bool {
        self.handles.iter().any(|(s, _)| s == surface)
    }

    fn is_complete(&self) -> bool {
        !self.surfaces.is_empty() && self.handles.len() == self.surfaces.len()
    }
}

/// Holds at most one [`LockSession`] and drives a [`LockSurface`] provider.
pub struct LockController<S: LockSurface> {
    provider: S,
    session: Option<LockSession<S::Handle>>,
}

impl<S: LockSurface> LockController<S> {
    /// Create a controller with no session.
    pub const fn new(provider: S) -> Self {
        Self {
            provider,
            session: None,
        }
    }

    /// Borrow the provider.
    pub const fn provider(&self) -> &S {
        &self.provider
    }

    /// The current session, if locked.
    pub const fn session(&self) -> Option<&LockSession<S::Handle>> {
        self.session.as_ref()
    }

    /// Whether a session exists.
    pub const fn is_locked(&self) -> bool {
        self.session.is_some()
    }

    /// Handles currently held.
    pub fn held(&self) -> usize {
        self.session.as_ref().map_or(0, LockSession::held)
    }

    /// Whether a session exists and holds a handle for every surface.
    pub fn is_fully_locked(&self) -> bool {
        self.session.as_ref().is_some_and(LockSession::is_complete)
    }

    /// Lock every surface.
    ///
    /// Starts a session if there is none; otherwise only surfaces without a
    /// held handle are attempted, so repeated calls are no-ops once every
    /// surface is locked.
    pub async fn lock(&mut self) -> LockReport {
        let provider = &mut self.provider;
        let session = self.session.get_or_insert_with(|| {
            let surfaces = provider.surfaces();
            info!(surfaces = surfaces.len(), "Starting lock session");
            LockSession::new(surfaces)
        });

        let missing: Vec<SurfaceId> = session
            .surfaces
            .iter()
            .filter(|s| !session.is_held(s))
            .cloned()
            .collect();

        let mut report = LockReport::default();
        for surface in missing {
            match provider.acquire(&surface).await {
                Ok(handle) => {
                    debug!(%surface, "Surface locked");
                    session.handles.push((surface.clone(), handle));
                    report.acquired.push(surface);
                }
                Err(e) => {
                    warn!(%surface, error = %e, "Could not lock surface");
                    report.failed.push(e);
                }
            }
        }

        report.held = session.held();
        report.surfaces = session.surfaces.len();
        report
    }

    /// Release every held lock and end the session.
    ///
    /// Release failures are logged and reported but never stop the sweep;
    /// each handle is handed to the provider exactly once.
    pub async fn unlock(&mut self) -> UnlockReport {
        let Some(session) = self.session.take() else {
            return UnlockReport::default();
        };

        let mut report = UnlockReport::default();
        for (surface, handle) in session.handles {
            match self.provider.release(handle).await {
                Ok(()) => {
                    debug!(%surface, "Surface unlocked");
                    report.released.push(surface);
                }
                Err(e) => {
                    warn!(%surface, error = %e, "Could not release surface lock");
                    report.failed.push(e);
                }
            }
        }

        let held_for = Utc::now() - session.started_at;
        info!(
            released = report.released.len(),
            failed = report.failed.len(),
            locked_secs = held_for.num_seconds(),
            "Lock session ended"
        );
        report
    }

    /// End the session without unlocking anything.
    ///
    /// Every held handle is handed to [`LockSurface::detach`], so the
    /// surfaces stay locked after this process exits. Returns the number of
    /// surfaces left locked.
    pub fn detach(&mut self) -> usize {
        let Some(session) = self.session.take() else {
            return 0;
        };

        let held = session.handles.len();
        for (surface, handle) in session.handles {
            debug!(%surface, "Leaving surface locked");
            self.provider.detach(handle);
        }
        info!(held, "Lock session detached");
        held
    }

    /// Drop handles whose lock has lapsed, returning their surfaces.
    ///
    /// The surfaces stay in the session, so the next [`Self::lock`] call
    /// re-acquires them.
    pub fn reap(&mut self) -> Vec<SurfaceId> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        let provider = &mut self.provider;
        let mut lapsed = Vec::new();
        session.handles.retain_mut(|(surface, handle)| {
            if provider.is_held(handle) {
                true
            } else {
                warn!(%surface, "Surface lock lapsed");
                lapsed.push(surface.clone());
                false
            }
        });
        lapsed
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSurface;
    use super::*;

    fn surfaces(names: &[&str]) -> Vec<SurfaceId> {
        names.iter().map(|n| SurfaceId::new(*n)).collect()
    }

    #[tokio::test]
    async fn test_lock_acquires_every_surface() {
        let provider = MockSurface::new(surfaces(&[":0", ":1"]));
        let mut locks = LockController::new(provider.clone());

        let report = locks.lock().await;
        assert_eq!(report.coverage(), Coverage::Full);
        assert_eq!(report.acquired, surfaces(&[":0", ":1"]));
        assert!(locks.is_fully_locked());
        assert_eq!(provider.held(), 2);
    }

    #[tokio::test]
    async fn test_lock_twice_is_idempotent() {
        let provider = MockSurface::new(surfaces(&[":0", ":1"]));
        let mut locks = LockController::new(provider.clone());

        locks.lock().await;
        let second = locks.lock().await;

        assert!(second.is_noop());
        assert_eq!(second.coverage(), Coverage::Full);
        assert_eq!(provider.acquire_count(), 2);
        assert_eq!(locks.session().map(LockSession::held), Some(2));
    }

    #[tokio::test]
    async fn test_partial_lock_continues_past_failure() {
        let provider = MockSurface::new(surfaces(&[":0", ":1", ":2"]));
        provider.fail_acquire(":1", 1);
        let mut locks = LockController::new(provider.clone());

        let report = locks.lock().await;
        assert_eq!(report.coverage(), Coverage::Partial);
        assert_eq!(report.acquired, surfaces(&[":0", ":2"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].surface(), &SurfaceId::new(":1"));
        assert!(locks.is_locked());
        assert!(!locks.is_fully_locked());

        let retry = locks.lock().await;
        assert_eq!(retry.acquired, surfaces(&[":1"]));
        assert_eq!(retry.coverage(), Coverage::Full);
    }

    #[tokio::test]
    async fn test_lock_with_everything_failing() {
        let provider = MockSurface::new(surfaces(&[":0"]));
        provider.fail_acquire(":0", 5);
        let mut locks = LockController::new(provider);

        let report = locks.lock().await;
        assert_eq!(report.coverage(), Coverage::Nothing);
        assert!(locks.is_locked());
    }

    #[tokio::test]
    async fn test_lock_without_surfaces_covers_nothing() {
        let mut locks = LockController::new(MockSurface::new(Vec::new()));
        let report = locks.lock().await;
        assert_eq!(report.coverage(), Coverage::Nothing);
        assert!(!locks.is_fully_locked());
    }

    #[tokio::test]
    async fn test_unlock_without_session_is_noop() {
        let provider = MockSurface::new(surfaces(&[":0"]));
        let mut locks = LockController::new(provider.clone());

        assert!(locks.unlock().await.is_noop());
        assert_eq!(provider.release_count(), 0);
    }

    #[tokio::test]
    async fn test_unlock_releases_all_even_on_failure() {
        let provider = MockSurface::new(surfaces(&[":0", ":1", ":2"]));
        provider.fail_release(":1");
        let mut locks = LockController::new(provider.clone());
        locks.lock().await;

        let report = locks.unlock().await;
        assert_eq!(report.released, surfaces(&[":0", ":2"]));
        assert_eq!(report.failed.len(), 1);
        assert!(!locks.is_locked());
        assert_eq!(provider.release_count(), 3);
        assert_eq!(provider.held(), 0);
    }

    #[tokio::test]
    async fn test_reap_drops_lapsed_handles() {
        let provider = MockSurface::new(surfaces(&[":0", ":1"]));
        let mut locks = LockController::new(provider.clone());
        locks.lock().await;

        provider.lapse(":0");
        assert_eq!(locks.reap(), surfaces(&[":0"]));
        assert!(locks.is_locked());
        assert!(!locks.is_fully_locked());

        let report = locks.lock().await;
        assert_eq!(report.acquired, surfaces(&[":0"]));
        assert!(locks.is_fully_locked());
    }

    #[tokio::test]
    async fn test_detach_keeps_surfaces_locked() {
        let provider = MockSurface::new(surfaces(&[":0", ":1"]));
        let mut locks = LockController::new(provider.clone());
        locks.lock().await;

        assert_eq!(locks.detach(), 2);
        assert!(!locks.is_locked());
        assert_eq!(provider.held(), 2);
        assert_eq!(provider.release_count(), 0);
        assert_eq!(provider.detach_count(), 2);
    }

    #[tokio::test]
    async fn test_detach_without_session() {
        let mut locks = LockController::new(MockSurface::new(surfaces(&[":0"])));
        assert_eq!(locks.detach(), 0);
    }

    #[tokio::test]
    async fn test_reap_without_session() {
        let mut locks = LockController::new(MockSurface::new(surfaces(&[":0"])));
        assert!(locks.reap().is_empty());
    }
}
