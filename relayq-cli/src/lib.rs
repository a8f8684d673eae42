//! relayq CLI
//!
//! `list`, `run` and `retry` over an application's command registry.
//! Applications build their queues, register them, then hand the registry to
//! [`execute`]:
//!
//! ```rust,no_run
//! use clap::Parser;
//! use relayq::server::Registry;
//! use relayq::Shutdown;
//! use relayq_cli::Cli;
//!
//! # async fn example(registry: Registry) -> color_eyre::Result<()> {
//! relayq_cli::execute(Cli::parse(), registry, Shutdown::new()).await
//! # }
//! ```

use clap::{Parser, Subcommand};
use relayq::server::{Registry, Runner, RunnerConfig};
use relayq::Shutdown;

#[derive(Debug, Parser)]
#[command(name = "relayq")]
#[command(about = "relayq CLI - Run queue consumers and retry loops", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List every runnable task
    List,
    /// Consume the given tasks (`all` for every task)
    Run {
        /// Task names, `topic:task`
        names: Vec<String>,
        /// Workers per task
        #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
        concurrency: i64,
    },
    /// Re-inject due retry records of the given tasks (`all` for every task)
    Retry {
        /// Task names, `topic:task`
        names: Vec<String>,
    },
}

/// Workers per task; unset or non-positive means 1
pub fn normalize_concurrency(concurrency: i64) -> usize {
    usize::try_from(concurrency).ok().filter(|&n| n > 0).unwrap_or(1)
}

/// Print the task list
pub fn print_list(registry: &Registry) {
    for line in registry.list_lines() {
        println!("{}", line);
    }
}

/// Run a parsed command line against `registry`
///
/// `run` and `retry` return once `shutdown` is triggered. Without names they
/// print the task list instead.
pub async fn execute(cli: Cli, registry: Registry, shutdown: Shutdown) -> color_eyre::Result<()> {
    execute_with(cli, registry, shutdown, RunnerConfig::default()).await
}

/// Same as [`execute`] with explicit runner timings
pub async fn execute_with(
    cli: Cli,
    registry: Registry,
    shutdown: Shutdown,
    config: RunnerConfig,
) -> color_eyre::Result<()> {
    match cli.command {
        Commands::List => print_list(&registry),
        Commands::Run { names, .. } | Commands::Retry { names } if names.is_empty() => {
            print_list(&registry)
        }
        Commands::Run { names, concurrency } => {
            let runner = Runner::new(registry, shutdown).with_config(config);
            runner.run(&names, normalize_concurrency(concurrency)).await?;
        }
        Commands::Retry { names } => {
            let runner = Runner::new(registry, shutdown).with_config(config);
            runner.run_retry(&names).await?;
        }
    }

    Ok(())
}
