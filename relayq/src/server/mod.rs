//! Server module
//!
//! Commands, the registry that names them, and the runner that keeps them
//! going as long-lived workers and retry loops.
//!
//! Every queue task advertises one [`Command`] named `topic:task` with two
//! entry points: `run` consumes the topic, `retry` re-injects due retry
//! records once. A [`Registry`] collects the commands of every queue of the
//! application; a [`Runner`] executes a selection of them.
//!
//! # Example
//!
//! ```rust,no_run
//! use relayq::server::{Registry, Runner};
//! use relayq::Shutdown;
//! # use relayq::Queue;
//! # async fn example(users: Queue<String>, orders: Queue<String>) -> relayq::Result<()> {
//! let mut registry = Registry::new();
//! registry.register(users.commands())?;
//! registry.register(orders.commands())?;
//!
//! let shutdown = Shutdown::new();
//! let runner = Runner::new(registry, shutdown.clone());
//! runner.run(&["all".to_string()], 4).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod scheduler;
pub mod worker;

pub use config::RunnerConfig;
pub use scheduler::Scheduler;
pub use worker::Worker;

use crate::shutdown::Shutdown;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Boxed, sendable future
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type RunFn = Arc<dyn Fn(Shutdown) -> BoxFuture<Result<()>> + Send + Sync>;
type RetryFn = Arc<dyn Fn() -> BoxFuture<Result<usize>> + Send + Sync>;

/// Named pair of run and retry entry points
#[derive(Clone)]
pub struct Command {
    name: String,
    run: RunFn,
    retry: RetryFn,
}

impl Command {
    /// Create a command from two closures
    ///
    /// `run` should block until the shutdown handle it receives is triggered.
    /// `retry` performs a single scan and returns the number of records
    /// re-injected.
    pub fn new<R, RFut, T, TFut>(name: impl Into<String>, run: R, retry: T) -> Self
    where
        R: Fn(Shutdown) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<()>> + Send + 'static,
        T: Fn() -> TFut + Send + Sync + 'static,
        TFut: Future<Output = Result<usize>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |shutdown| Box::pin(run(shutdown))),
            retry: Arc::new(move || Box::pin(retry())),
        }
    }

    /// Command name, `topic:task` for queue commands
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the command until `shutdown`
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        (self.run)(shutdown).await
    }

    /// Run one retry scan
    pub async fn retry(&self) -> Result<usize> {
        (self.retry)().await
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command").field("name", &self.name).finish()
    }
}

/// Token selecting every registered command
pub const ALL: &str = "all";

/// Command registry
///
/// Names are unique and kept sorted.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    commands: BTreeMap<String, Command>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one command; fails if the name is taken
    pub fn add(&mut self, command: Command) -> Result<()> {
        if command.name.is_empty() || command.name == ALL {
            return Err(Error::Config(format!("invalid command name '{}'", command.name)));
        }
        if self.commands.contains_key(&command.name) {
            return Err(Error::Config(format!("command '{}' registered twice", command.name)));
        }
        self.commands.insert(command.name.clone(), command);
        Ok(())
    }

    /// Add every command of a queue
    pub fn register(&mut self, commands: impl IntoIterator<Item = Command>) -> Result<()> {
        for command in commands {
            self.add(command)?;
        }
        Ok(())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    /// Look up one command
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Resolve a name list
    ///
    /// A leading `all` is dropped; if nothing remains every command is
    /// selected. Unknown names are logged and skipped, repeated ones are
    /// selected once.
    pub fn select(&self, names: &[String]) -> Vec<Command> {
        let names = match names.split_first() {
            Some((first, rest)) if first == ALL => rest,
            _ => names,
        };
        if names.is_empty() {
            return self.commands.values().cloned().collect();
        }

        let mut selected: Vec<Command> = Vec::with_capacity(names.len());
        for name in names {
            match self.commands.get(name) {
                Some(command) if !selected.iter().any(|c| c.name == *name) => {
                    selected.push(command.clone());
                }
                Some(_) => {}
                None => tracing::warn!("[task] unknown command: {}", name),
            }
        }
        selected
    }

    /// Lines printed by `list`
    pub fn list_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.commands.len() + 2);
        lines.push("tasks:".to_string());
        lines.push(format!("* {}", ALL));
        lines.extend(self.commands.keys().map(|name| format!("* {}", name)));
        lines
    }
}

/// Runs registry commands as workers and retry loops
#[derive(Debug, Clone)]
pub struct Runner {
    registry: Arc<Registry>,
    shutdown: Shutdown,
    config: RunnerConfig,
}

impl Runner {
    /// Create a runner with default timings
    pub fn new(registry: Registry, shutdown: Shutdown) -> Self {
        Self {
            registry: Arc::new(registry),
            shutdown,
            config: RunnerConfig::default(),
        }
    }

    /// Use other timings
    #[must_use]
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry in use
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the selected commands, `concurrency` workers each
    ///
    /// A concurrency of 0 counts as 1. All workers share
    /// `commands * concurrency` slots. Returns once every worker stopped,
    /// which only happens on shutdown.
    pub async fn run(&self, names: &[String], concurrency: usize) -> Result<()> {
        let commands = self.registry.select(names);
        if commands.is_empty() {
            tracing::warn!("No command selected");
            return Ok(());
        }

        let concurrency = concurrency.max(1);
        let slots = Arc::new(Semaphore::new(commands.len() * concurrency));
        let mut join_set = JoinSet::new();

        for command in &commands {
            tracing::info!("[task.run] name: {}, workers: {}", command.name(), concurrency);
            for number in 0..concurrency {
                let worker = Worker::new(
                    command.clone(),
                    number,
                    slots.clone(),
                    self.shutdown.clone(),
                    self.config.run_pause,
                );
                join_set.spawn(worker.run());
            }
        }

        Self::join_all(&mut join_set).await;
        tracing::info!("Workers stopped");
        Ok(())
    }

    /// Run one retry loop per selected command
    ///
    /// Returns once every loop stopped, which only happens on shutdown.
    pub async fn run_retry(&self, names: &[String]) -> Result<()> {
        let commands = self.registry.select(names);
        if commands.is_empty() {
            tracing::warn!("No command selected");
            return Ok(());
        }

        let mut join_set = JoinSet::new();
        for command in commands {
            tracing::info!("[task.retry] name: {}", command.name());
            let scheduler =
                Scheduler::new(command, self.shutdown.clone(), self.config.retry_interval);
            join_set.spawn(scheduler.run());
        }

        Self::join_all(&mut join_set).await;
        tracing::info!("Retry loops stopped");
        Ok(())
    }

    async fn join_all(join_set: &mut JoinSet<usize>) {
        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Command {
        Command::new(name, |_shutdown: Shutdown| async { Ok(()) }, || async { Ok(0) })
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(vec![noop("users:welcome"), noop("users:digest"), noop("orders:paid")])
            .unwrap();
        registry
    }

    fn names(commands: &[Command]) -> Vec<&str> {
        commands.iter().map(Command::name).collect()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = registry();
        assert!(matches!(registry.add(noop("users:welcome")), Err(Error::Config(_))));
        assert!(registry.add(noop("all")).is_err());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_select_all() {
        let registry = registry();
        let all = vec!["orders:paid", "users:digest", "users:welcome"];
        assert_eq!(names(&registry.select(&[])), all);
        assert_eq!(names(&registry.select(&args(&["all"]))), all);
    }

    #[test]
    fn test_select_explicit_names() {
        let registry = registry();
        let selected =
            registry.select(&args(&["users:welcome", "nope", "orders:paid", "users:welcome"]));
        assert_eq!(names(&selected), vec!["users:welcome", "orders:paid"]);

        let selected = registry.select(&args(&["all", "users:digest"]));
        assert_eq!(names(&selected), vec!["users:digest"]);
    }

    #[test]
    fn test_list_lines() {
        assert_eq!(
            registry().list_lines(),
            vec!["tasks:", "* all", "* orders:paid", "* users:digest", "* users:welcome"]
        );
    }

    #[tokio::test]
    async fn test_command_entry_points() {
        let command = Command::new(
            "users:welcome",
            |shutdown: Shutdown| async move {
                shutdown.triggered().await;
                Ok(())
            },
            || async { Ok(3) },
        );
        assert_eq!(command.retry().await.unwrap(), 3);

        let shutdown = Shutdown::new();
        shutdown.trigger();
        command.run(shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_without_selection_returns() {
        let runner = Runner::new(registry(), Shutdown::new());
        runner.run(&args(&["nope"]), 2).await.unwrap();
        runner.run_retry(&args(&["nope"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_with_zero_scan_interval() {
        let scans = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = scans.clone();
        let mut registry = Registry::new();
        registry
            .add(Command::new(
                "users:welcome",
                |_shutdown: Shutdown| async { Ok(()) },
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(0)
                    }
                },
            ))
            .unwrap();

        let shutdown = Shutdown::new();
        let settings = crate::Settings::default().with_retry_scan_secs(0);
        let runner =
            Runner::new(registry, shutdown.clone()).with_config(RunnerConfig::from(&settings));
        let handle = tokio::spawn(async move { runner.run_retry(&[]).await });

        while scans.load(std::sync::atomic::Ordering::SeqCst) < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!handle.is_finished());
        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }
}
