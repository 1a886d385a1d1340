//! Cooperative shutdown signalling

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One-shot stop flag shared between tasks
///
/// Loops race their I/O against [`ShutdownSignal::wait`], so a trigger is
/// observed as soon as the current await point yields rather than after a
/// polling interval. Once triggered the signal stays triggered.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown, waking every current waiter
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Check if shutdown was triggered
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Wait for shutdown signal
    ///
    /// Cancel safe. Returns immediately if the signal is already triggered.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a trigger in between is not lost
            notified.as_mut().enable();

            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();

        assert!(!signal.is_triggered());

        signal.trigger();

        assert!(signal.is_triggered());
        assert!(signal.clone().is_triggered());
    }

    #[tokio::test]
    async fn test_shutdown_wait() {
        let signal = ShutdownSignal::new();
        let signal_clone = signal.clone();

        // Trigger after delay
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            signal_clone.trigger();
        });

        // Wait for signal
        let start = tokio::time::Instant::now();
        signal.wait().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("wait blocked on an already triggered signal");
    }

    #[tokio::test]
    async fn test_many_waiters_released() {
        let signal = ShutdownSignal::new();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.trigger();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not released")
                .unwrap();
        }
    }
}
