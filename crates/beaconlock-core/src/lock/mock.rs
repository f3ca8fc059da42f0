//! In-memory [`LockSurface`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{LockError, LockSurface};
use crate::types::SurfaceId;

#[derive(Debug, Default)]
struct SurfaceState {
    surfaces: Vec<SurfaceId>,
    held: HashSet<SurfaceId>,
    lapsed: HashSet<SurfaceId>,
    acquire_failures: HashMap<SurfaceId, usize>,
    release_failures: HashSet<SurfaceId>,
    acquires: usize,
    releases: usize,
    detaches: usize,
}

/// Records locks in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockSurface {
    state: Arc<Mutex<SurfaceState>>,
}

/// Handle returned by [`MockSurface`].
#[derive(Debug)]
pub struct MockLockHandle {
    surface: SurfaceId,
}

impl MockSurface {
    /// A provider exposing `surfaces`.
    #[must_use]
    pub fn new(surfaces: Vec<SurfaceId>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SurfaceState {
                surfaces,
                ..SurfaceState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` acquisitions of `surface`.
    pub fn fail_acquire(&self, surface: &str, count: usize) {
        self.state()
            .acquire_failures
            .insert(SurfaceId::new(surface), count);
    }

    /// Fail every release of `surface`.
    pub fn fail_release(&self, surface: &str) {
        self.state().release_failures.insert(SurfaceId::new(surface));
    }

    /// Make the held lock on `surface` report as lapsed.
    pub fn lapse(&self, surface: &str) {
        self.state().lapsed.insert(SurfaceId::new(surface));
    }

    /// Surfaces currently locked.
    #[must_use]
    pub fn held(&self) -> usize {
        self.state().held.len()
    }

    /// Total `acquire` calls.
    #[must_use]
    pub fn acquire_count(&self) -> usize {
        self.state().acquires
    }

    /// Total `release` calls.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.state().releases
    }

    /// Total `detach` calls.
    #[must_use]
    pub fn detach_count(&self) -> usize {
        self.state().detaches
    }
}

impl LockSurface for MockSurface {
    type Handle = MockLockHandle;

    fn surfaces(&self) -> Vec<SurfaceId> {
        self.state().surfaces.clone()
    }

    async fn acquire(&mut self, surface: &SurfaceId) -> Result<MockLockHandle, LockError> {
        let mut state = self.state();
        state.acquires += 1;
        if let Some(remaining) = state.acquire_failures.get_mut(surface) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LockError::Acquire {
                    surface: surface.clone(),
                    reason: "scripted failure".to_string(),
                });
            }
        }
        state.lapsed.remove(surface);
        state.held.insert(surface.clone());
        Ok(MockLockHandle {
            surface: surface.clone(),
        })
    }

    async fn release(&mut self, handle: MockLockHandle) -> Result<(), LockError> {
        let mut state = self.state();
        state.releases += 1;
        state.held.remove(&handle.surface);
        if state.release_failures.contains(&handle.surface) {
            return Err(LockError::Release {
                surface: handle.surface,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn detach(&mut self, _handle: MockLockHandle) {
        self.state().detaches += 1;
    }

    fn is_held(&mut self, handle: &mut MockLockHandle) -> bool {
        let mut state = self.state();
        if state.lapsed.contains(&handle.surface) {
            state.held.remove(&handle.surface);
            false
        } else {
            true
        }
    }
}
