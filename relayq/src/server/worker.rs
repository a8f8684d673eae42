//! Worker implementation
//!
//! A worker repeatedly runs one command. Every attempt holds a slot of the
//! runner's shared semaphore, so the number of commands running at once is
//! bounded across all workers.

use super::Command;
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Worker - runs one command in a loop until shutdown
pub struct Worker {
    /// Worker ID, `name#number`
    pub id: String,

    /// Index among the workers of the same command
    number: usize,

    command: Command,

    slots: Arc<Semaphore>,

    shutdown: Shutdown,

    pause: Duration,
}

impl Worker {
    /// Create a new worker
    pub fn new(
        command: Command,
        number: usize,
        slots: Arc<Semaphore>,
        shutdown: Shutdown,
        pause: Duration,
    ) -> Self {
        Self {
            id: format!("{}#{}", command.name(), number),
            number,
            command,
            slots,
            shutdown,
            pause,
        }
    }

    /// Run until shutdown
    ///
    /// Each iteration acquires a slot, runs the command, logs its error if
    /// any, pauses, then releases the slot. A fatal error stops the worker.
    /// Returns the number of attempts.
    pub async fn run(self) -> usize {
        tracing::debug!("Worker {} starting", self.id);
        let mut attempts = 0;

        while !self.shutdown.is_triggered() {
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.triggered() => break,
            };

            attempts += 1;
            if let Err(e) = self.command.run(self.shutdown.clone()).await {
                tracing::error!(
                    "[task.run] name: {}, number: {}, error: {}",
                    self.command.name(),
                    self.number,
                    e
                );
                if e.is_fatal() {
                    break;
                }
            }

            let interrupted = self.shutdown.sleep(self.pause).await;
            drop(permit);
            if interrupted {
                break;
            }
        }

        tracing::debug!("Worker {} stopped after {} attempts", self.id, attempts);
        attempts
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pause", &self.pause)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing(calls: Arc<AtomicUsize>) -> Command {
        Command::new(
            "users:welcome",
            move |_shutdown: Shutdown| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Connection("broker down".into()))
                }
            },
            || async { Ok(0) },
        )
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_the_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::new();
        let worker = Worker::new(
            failing(calls.clone()),
            0,
            Arc::new(Semaphore::new(1)),
            shutdown.clone(),
            Duration::from_millis(5),
        );
        assert_eq!(worker.id, "users:welcome#0");

        let handle = tokio::spawn(worker.run());
        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();

        let attempts = handle.await.unwrap();
        assert!(attempts >= 3);
    }

    #[tokio::test]
    async fn test_waits_for_a_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::new();
        let slots = Arc::new(Semaphore::new(1));
        let held = slots.clone().acquire_owned().await.unwrap();

        let worker = Worker::new(
            failing(calls.clone()),
            0,
            slots,
            shutdown.clone(),
            Duration::from_millis(5),
        );
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(held);
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_triggered_before_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let worker = Worker::new(
            failing(calls.clone()),
            0,
            Arc::new(Semaphore::new(1)),
            shutdown,
            Duration::from_secs(1),
        );
        assert_eq!(worker.run().await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_the_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let command = Command::new(
            "users:nope",
            move |_shutdown: Shutdown| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::UndefinedTask {
                        topic: "users".into(),
                        task: "nope".into(),
                    })
                }
            },
            || async { Ok(0) },
        );

        let shutdown = Shutdown::new();
        let worker = Worker::new(
            command,
            0,
            Arc::new(Semaphore::new(1)),
            shutdown.clone(),
            Duration::from_millis(5),
        );

        let attempts = tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!shutdown.is_triggered());
    }
}
