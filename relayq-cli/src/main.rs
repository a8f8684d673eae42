//! relayq demo binary
//!
//! Wires an `email` queue over a Redis stream with a SQLite retry store from
//! environment settings, then runs the requested command until Ctrl+C.

use clap::Parser;
use relayq::broker::{RedisStreamBroker, StreamConfig};
use relayq::middleware::LoggingMiddleware;
use relayq::processor::{handler_fn, TaskContext};
use relayq::retry::SqlRetryStore;
use relayq::server::{Registry, RunnerConfig};
use relayq::storage::{RedisClient, RedisConfig};
use relayq::{Error, Queue, Settings, Shutdown, TaskOptions};
use relayq_cli::Cli;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Email {
    email: String,
}

async fn build_registry(settings: &Settings) -> relayq::Result<Registry> {
    let redis = RedisClient::new(RedisConfig::from(settings)).await?;
    let broker = RedisStreamBroker::with_config(redis, StreamConfig::from(settings));
    let retry_store = SqlRetryStore::from_settings(settings).await?;

    let email = Queue::<Email>::define("email")
        .broker(broker)
        .retry_store(retry_store)
        .middleware(LoggingMiddleware::new())
        .add_task(
            "send",
            handler_fn(|ctx: TaskContext, mail: Email| async move {
                if !mail.email.contains('@') {
                    return Err(Error::handler(format!("invalid address '{}'", mail.email)));
                }
                tracing::info!("[email.send] to: {}, retry: {}", mail.email, ctx.retry_count());
                Ok(())
            }),
            TaskOptions::new(5, settings.retry_interval_secs),
        )
        .build()?;

    let mut registry = Registry::new();
    registry.register(email.commands())?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let registry = build_registry(&settings).await?;

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
        }
        signal.trigger();
    });

    relayq_cli::execute_with(cli, registry, shutdown, RunnerConfig::from(&settings)).await
}
