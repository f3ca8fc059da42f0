//! SIGINT/SIGTERM handling.
//!
//! The listener task only requests shutdown; teardown stays on the main task.

use std::io;

use beaconlock_core::ShutdownTrigger;
use tokio::task::JoinHandle;
use tracing::info;

/// Install the signal listeners and spawn a task that fires `trigger` on the
/// first signal.
///
/// Listeners are registered before this returns, so a signal arriving right
/// after is not lost. Abort the returned task on exit.
///
/// # Errors
///
/// Returns an error if a signal listener cannot be registered.
pub fn spawn(trigger: ShutdownTrigger) -> io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
            trigger.trigger();
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                trigger.trigger();
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beaconlock_core::shutdown;

    #[tokio::test]
    async fn test_listener_installs_without_firing() {
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio_test::assert_ok!(spawn(trigger));
        tokio::task::yield_now().await;

        assert!(!shutdown.is_requested());
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
