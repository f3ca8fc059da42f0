//! Cooperative shutdown signalling.
//!
//! Signal handlers only flip a flag through [`ShutdownTrigger`]. The main
//! loop observes it through [`Shutdown`] at the top of every cycle and while
//! sleeping between cycles, and performs all teardown itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Create a connected trigger/observer pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

/// Requests shutdown. Cheap to clone and safe to call from any task.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Request shutdown. Repeated calls are harmless.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes whether shutdown has been requested.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested.
    ///
    /// Never completes if every trigger is dropped without firing.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown arrives first.
    ///
    /// Returns `true` if shutdown has been requested.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => self.is_requested(),
            () = self.requested() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_sets_flag() {
        let (trigger, shutdown) = channel();
        assert!(!shutdown.is_requested());
        trigger.trigger();
        trigger.trigger();
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn test_sleep_completes_without_trigger() {
        let (_trigger, mut shutdown) = channel();
        assert!(!shutdown.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_trigger() {
        let (trigger, mut shutdown) = channel();
        let task = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(3600)).await });
        trigger.trigger();
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_observe_same_flag() {
        let (trigger, shutdown) = channel();
        let other = shutdown.clone();
        trigger.clone().trigger();
        assert!(shutdown.is_requested() && other.is_requested());
    }

    #[tokio::test]
    async fn test_dropped_trigger_does_not_request() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);
        assert!(!shutdown.sleep(Duration::from_millis(5)).await);
    }
}
