//! Retry scheduler
//!
//! Calls a command's retry entry point once per interval, moving due retry
//! records back onto the topic, until shutdown.

use super::Command;
use crate::shutdown::Shutdown;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Shortest pause between two scans
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(1);

/// Scheduler - periodic retry scan of one command
pub struct Scheduler {
    command: Command,
    shutdown: Shutdown,
    interval: Duration,
}

impl Scheduler {
    /// Create a new scheduler
    ///
    /// `interval` is raised to [`MIN_SCAN_INTERVAL`] when shorter.
    #[must_use]
    pub fn new(command: Command, shutdown: Shutdown, interval: Duration) -> Self {
        Self {
            command,
            shutdown,
            interval: interval.max(MIN_SCAN_INTERVAL),
        }
    }

    /// Run the scan loop
    ///
    /// Scan errors are logged and the loop continues. Returns the total number
    /// of records re-injected.
    pub async fn run(self) -> usize {
        tracing::debug!("Retry scheduler started for {}", self.command.name());

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = 0;

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.triggered() => break,
            }

            match self.command.retry().await {
                Ok(0) => {}
                Ok(pushed) => {
                    tracing::debug!(
                        "[task.retry] topic: {}, pushed: {}",
                        self.command.name(),
                        pushed
                    );
                    total += pushed;
                }
                Err(e) => {
                    tracing::error!("[task.retry] topic: {}, error: {}", self.command.name(), e);
                }
            }
        }

        tracing::debug!("Retry scheduler stopped for {}", self.command.name());
        total
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("command", &self.command.name())
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_scans_until_shutdown() {
        let scans = Arc::new(AtomicUsize::new(0));
        let counter = scans.clone();
        let command = Command::new(
            "users:welcome",
            |_shutdown: Shutdown| async { Ok(()) },
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        Ok(2)
                    } else {
                        Err(Error::Connection("store down".into()))
                    }
                }
            },
        );

        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(command, shutdown.clone(), Duration::from_millis(5));
        let handle = tokio::spawn(scheduler.run());

        while scans.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();

        let total = handle.await.unwrap();
        assert!(total >= 4);
        assert_eq!(total % 2, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_still_scans() {
        let scans = Arc::new(AtomicUsize::new(0));
        let counter = scans.clone();
        let command = Command::new(
            "users:welcome",
            |_shutdown: Shutdown| async { Ok(()) },
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            },
        );

        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(command, shutdown.clone(), Duration::ZERO);
        assert_eq!(scheduler.interval, MIN_SCAN_INTERVAL);
        let handle = tokio::spawn(scheduler.run());

        while scans.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();

        let total = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(total >= 3);
    }
}
