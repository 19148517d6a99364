//! Task Bridge - async RabbitMQ task publishing and consumption.
//!
//! This library provides the shared components for the two binaries:
//! - `task-bridge-api`: HTTP server that enqueues tasks, with an embedded consumer
//! - `task-bridge-consumer`: standalone consumer process
//!
//! ## Architecture
//!
//! ```text
//! HTTP → Publisher ─┐                       ┌→ Dispatcher → TaskRegistry → handler
//!                   └→ ConnectionManager ───┘
//!                        (one connection, one channel, auto-reconnect)
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod tasks;
pub mod web;

// Re-export commonly used types
pub use broker::{BrokerError, MemoryBroker, QueueOptions};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use consumer::{ConsumeError, Dispatcher, DEFAULT_PREFETCH};
pub use queue::{Envelope, PublishError, Publisher, DEFAULT_QUEUE};
pub use registry::{handler_fn, Delivery, FallbackPolicy, Outcome, TaskHandler, TaskRegistry};
pub use web::AppState;
