//! Task Bridge Consumer - standalone RabbitMQ task consumer.
//!
//! Consumes tasks from the configured queue and dispatches them to the
//! built-in handlers until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use task_bridge::shutdown::shutdown_signal;
use task_bridge::tasks::default_registry;
use task_bridge::{Config, ConnectionManager, Dispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");
    info!(
        rmq_host = %config.rmq_host,
        rmq_port = config.rmq_port,
        queue = %config.rmq_queue,
        prefetch_count = config.prefetch_count,
        unknown_task_policy = ?config.unknown_task_policy,
        "config_loaded"
    );

    let url = config.amqp_url().context("Failed to build broker URL")?;
    let manager = ConnectionManager::amqp(url, config.reconnect_policy());
    manager.connect().await;
    if !manager.status().await {
        bail!("Failed to connect to RabbitMQ");
    }

    let registry = default_registry(config.unknown_task_policy)
        .context("Failed to build task registry")?;
    let mut dispatcher =
        Dispatcher::new(manager.clone(), Arc::new(registry)).with_prefetch(config.prefetch_count);
    dispatcher
        .declare_queue(config.rmq_queue.clone(), config.queue_options())
        .await
        .context("Failed to declare queue")?;

    info!("worker_ready");
    let consumed = dispatcher.consume(shutdown_signal()).await;

    manager.disconnect().await;
    consumed.context("Consumer failed")?;

    info!("worker_shutdown_complete");
    Ok(())
}
