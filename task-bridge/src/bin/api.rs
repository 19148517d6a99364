//! Task Bridge API - HTTP server with an embedded task consumer.
//!
//! Serves `/health` and `/test/`, which enqueues a test task. The embedded
//! consumer shares the server's broker connection. On SIGINT/SIGTERM the
//! server drains, the consumer stops, then the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use task_bridge::consumer::ConsumeError;
use task_bridge::shutdown::shutdown_signal;
use task_bridge::tasks::default_registry;
use task_bridge::web::{router, AppState};
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

    info!("web_server_starting");
    info!(
        port = config.port,
        rmq_host = %config.rmq_host,
        rmq_port = config.rmq_port,
        queue = %config.rmq_queue,
        "config_loaded"
    );

    let url = config.amqp_url().context("Failed to build broker URL")?;
    let manager = ConnectionManager::amqp(url, config.reconnect_policy());
    manager.connect().await;

    let (stop_consumer, consumer_stop) = oneshot::channel::<()>();
    let consumer = start_consumer(&config, &manager, consumer_stop).await?;

    let state = AppState::new(config.clone(), manager.clone());
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error");

    let _ = stop_consumer.send(());
    if let Some(consumer) = consumer {
        match consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "embedded_consumer_failed"),
            Err(e) => error!(error = %e, "embedded_consumer_join_failed"),
        }
    }

    manager.disconnect().await;
    served?;

    info!("web_server_shutdown_complete");
    Ok(())
}

/// Spawn the embedded consumer. Without a broker connection the server still
/// starts, only without a consumer.
async fn start_consumer(
    config: &Config,
    manager: &ConnectionManager,
    stop: oneshot::Receiver<()>,
) -> Result<Option<JoinHandle<Result<(), ConsumeError>>>> {
    if !manager.status().await {
        warn!("embedded_consumer_disabled_broker_unavailable");
        return Ok(None);
    }

    let registry = default_registry(config.unknown_task_policy)
        .context("Failed to build task registry")?;
    let mut dispatcher =
        Dispatcher::new(manager.clone(), Arc::new(registry)).with_prefetch(config.prefetch_count);

    if let Err(e) = dispatcher
        .declare_queue(config.rmq_queue.clone(), config.queue_options())
        .await
    {
        warn!(queue = %config.rmq_queue, error = %e, "embedded_consumer_declare_failed");
        return Ok(None);
    }

    info!(queue = %config.rmq_queue, "embedded_consumer_starting");
    Ok(Some(tokio::spawn(dispatcher.consume(async move {
        let _ = stop.await;
    }))))
}
