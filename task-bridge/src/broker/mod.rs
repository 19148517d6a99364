//! Broker transport seam.
//!
//! The connection manager, publisher and consumer only talk to the broker
//! through the traits in this module. Two transports implement them:
//!
//! - [`amqp`]: the production transport, backed by lapin (AMQP 0-9-1)
//! - [`memory`]: an in-process reference broker used by the test suite and
//!   available to applications that want a test double
//!
//! The trait methods mirror the AMQP methods they stand for (`basic.qos`,
//! `queue.declare`, `tx.select`, ...) so the lapin adapter stays a thin shim.

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Errors raised by a broker transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Options for `queue.declare`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
}

/// A delivery as handed over by the transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    /// Broker-assigned tag, scoped to the channel that received it.
    pub delivery_tag: u64,
    /// Set when the message was delivered before and returned to the queue.
    pub redelivered: bool,
    /// Message body.
    pub body: Vec<u8>,
}

/// Stream of deliveries for one `basic.consume` subscription.
///
/// The stream ends when the subscription's channel closes.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, BrokerError>>;

/// Opens transport-level connections to a broker endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A transport-level session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical sub-session over a connection. Used for publishing and consuming.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;

    /// Cap the number of unacknowledged deliveries on this channel. Zero means
    /// no limit.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Publish `body` to `exchange` with `routing_key`. The empty exchange name
    /// is the default exchange, which routes by queue name.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Put the channel in transactional mode. Publishes and settlements made
    /// afterwards only take effect on [`tx_commit`](Self::tx_commit).
    async fn tx_select(&self) -> Result<(), BrokerError>;

    async fn tx_commit(&self) -> Result<(), BrokerError>;

    async fn tx_rollback(&self) -> Result<(), BrokerError>;
}
