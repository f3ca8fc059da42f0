//! Lock surfaces backed by an external screen-locker process.
//!
//! One locker child is spawned per X display with `DISPLAY` pointing at it.
//! The child is the lock: killing it unlocks the display. A locker that
//! exits within the startup grace period failed to grab its display.
//!
//! Children are not killed on drop. A detached handle leaves its locker
//! running after this process exits, so the display stays locked.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{LockError, LockSurface};
use crate::config::LockConfig;
use crate::types::SurfaceId;

/// Runs the configured locker command once per display.
#[derive(Debug, Clone)]
pub struct CommandSurface {
    program: String,
    args: Vec<String>,
    displays: Vec<SurfaceId>,
    grace: Duration,
}

/// A running locker process.
#[derive(Debug)]
pub struct LockerProcess {
    surface: SurfaceId,
    child: Child,
}

impl LockerProcess {
    /// The display this locker covers.
    #[must_use]
    pub const fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    /// OS process id, if the child has not been reaped.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

impl CommandSurface {
    /// Build from `[lock]` configuration.
    #[must_use]
    pub fn new(config: &LockConfig) -> Self {
        let mut command = config.command.iter().cloned();
        Self {
            program: command.next().unwrap_or_default(),
            args: command.collect(),
            displays: config.displays.iter().cloned().map(SurfaceId).collect(),
            grace: config.startup_grace(),
        }
    }

    fn acquire_error(surface: &SurfaceId, reason: impl Into<String>) -> LockError {
        LockError::Acquire {
            surface: surface.clone(),
            reason: reason.into(),
        }
    }
}

impl LockSurface for CommandSurface {
    type Handle = LockerProcess;

    fn surfaces(&self) -> Vec<SurfaceId> {
        self.displays.clone()
    }

    async fn acquire(&mut self, surface: &SurfaceId) -> Result<LockerProcess, LockError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("DISPLAY", surface.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| {
                Self::acquire_error(surface, format!("could not start {}: {e}", self.program))
            })?;

        match tokio::time::timeout(self.grace, child.wait()).await {
            Err(_) => {}
            Ok(Ok(status)) => {
                return Err(Self::acquire_error(
                    surface,
                    format!("{} exited during startup with {status}", self.program),
                ));
            }
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return Err(Self::acquire_error(surface, e.to_string()));
            }
        }

        info!(%surface, pid = child.id(), program = %self.program, "Locker started");
        Ok(LockerProcess {
            surface: surface.clone(),
            child,
        })
    }

    async fn release(&mut self, mut handle: LockerProcess) -> Result<(), LockError> {
        if let Ok(Some(status)) = handle.child.try_wait() {
            debug!(surface = %handle.surface, %status, "Locker had already exited");
            return Ok(());
        }

        handle.child.kill().await.map_err(|e| {
            warn!(surface = %handle.surface, error = %e, "Could not stop locker");
            LockError::Release {
                surface: handle.surface.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(surface = %handle.surface, "Locker stopped");
        Ok(())
    }

    fn is_held(&mut self, handle: &mut LockerProcess) -> bool {
        match handle.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(surface = %handle.surface, %status, "Locker exited");
                false
            }
            Err(e) => {
                warn!(surface = %handle.surface, error = %e, "Could not poll locker");
                false
            }
        }
    }

    fn detach(&mut self, handle: LockerProcess) {
        info!(surface = %handle.surface, pid = handle.pid(), "Leaving locker running");
    }
}
