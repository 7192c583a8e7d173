//! Caller-driven cancellation.
//!
//! An [`AbortController`] owns the trigger; any number of [`AbortSignal`]
//! clones observe it. Waiting on a signal is cancel-safe and is meant to be
//! raced against in-flight I/O and retry sleeps with `tokio::select!`.

use tokio::sync::watch;

/// Owner side of an abort signal
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl AbortController {
    /// Create a new controller
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Get a signal bound to this controller
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: Some(self.rx.clone()),
        }
    }

    /// Trigger the abort. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Whether abort was triggered
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of an abort signal
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl AbortSignal {
    /// A signal that never fires
    #[must_use]
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether abort was triggered
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once abort is triggered.
    ///
    /// Stays pending forever when the controller is dropped without aborting.
    pub async fn aborted(&self) {
        let Some(mut rx) = self.rx.clone() else {
            return futures::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_wakes_waiter() {
        let controller = AbortController::new();
        let signal = controller.signal();

        let waiter = tokio::spawn(async move {
            signal.aborted().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.abort();

        assert!(waiter.await.unwrap());
        assert!(controller.is_aborted());
    }

    #[tokio::test]
    async fn test_already_aborted_resolves_immediately() {
        let controller = AbortController::new();
        controller.abort();
        let signal = controller.signal();
        assert!(signal.is_aborted());
        tokio::time::timeout(Duration::from_millis(50), signal.aborted())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let signal = AbortSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.aborted()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropped_controller_never_fires() {
        let signal = {
            let controller = AbortController::new();
            controller.signal()
        };
        let result = tokio::time::timeout(Duration::from_millis(20), signal.aborted()).await;
        assert!(result.is_err());
        assert!(!signal.is_aborted());
    }
}
