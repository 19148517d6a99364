//! Transactional batch publisher.
//!
//! All envelopes passed to one [`Publisher::publish`] call go out inside a
//! single AMQP transaction on the shared channel: consumers see either the
//! whole batch or none of it.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::envelope::{self, CodecError, Envelope};
use crate::broker::{BrokerChannel, BrokerError};
use crate::connection::ConnectionManager;

/// The default exchange routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

/// Errors from publishing a batch.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("the message could not be sent because the connection with RabbitMQ is not established")]
    NotConnected,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("publish transaction failed: {0}")]
    Transaction(#[from] BrokerError),
}

/// Publishes envelopes through the manager's channel.
#[derive(Clone)]
pub struct Publisher {
    manager: ConnectionManager,
    default_destination: String,
}

impl Publisher {
    /// Create a publisher routing to `default_destination` unless told
    /// otherwise.
    pub fn new(manager: ConnectionManager, default_destination: impl Into<String>) -> Self {
        Self {
            manager,
            default_destination: default_destination.into(),
        }
    }

    pub fn default_destination(&self) -> &str {
        &self.default_destination
    }

    /// Publish a single envelope to the default destination.
    pub async fn publish_one(&self, envelope: &Envelope) -> Result<(), PublishError> {
        self.publish(std::slice::from_ref(envelope), None).await
    }

    /// Publish `envelopes` atomically to `destination` (a queue name on the
    /// default exchange), or to the default destination when `None`.
    ///
    /// Fails with [`PublishError::NotConnected`] without touching the broker if
    /// the channel is not open. Every envelope is encoded before the
    /// transaction starts. On any broker error the transaction is rolled back.
    pub async fn publish(
        &self,
        envelopes: &[Envelope],
        destination: Option<&str>,
    ) -> Result<(), PublishError> {
        let handle = self
            .manager
            .channel()
            .await
            .ok_or(PublishError::NotConnected)?;
        let routing_key = destination.unwrap_or(self.default_destination.as_str());

        let bodies = envelopes
            .iter()
            .map(envelope::encode)
            .collect::<Result<Vec<_>, _>>()?;
        if bodies.is_empty() {
            debug!(queue = %routing_key, "rabbitmq_publish_empty_batch");
            return Ok(());
        }

        let mut tx = handle.lock_transactions().await;
        let channel = handle.channel();
        if !tx.selected {
            channel.tx_select().await?;
            tx.selected = true;
        }

        if let Err(e) = publish_batch(channel, routing_key, &bodies).await {
            if let Err(rollback_err) = channel.tx_rollback().await {
                warn!(error = %rollback_err, "rabbitmq_rollback_failed");
            }
            warn!(queue = %routing_key, error = %e, "rabbitmq_publish_rolled_back");
            return Err(e.into());
        }

        info!(
            queue = %routing_key,
            batch_size = bodies.len(),
            body_length = bodies.iter().map(Vec::len).sum::<usize>(),
            "rabbitmq_batch_published"
        );

        Ok(())
    }
}

async fn publish_batch(
    channel: &dyn BrokerChannel,
    routing_key: &str,
    bodies: &[Vec<u8>],
) -> Result<(), BrokerError> {
    for body in bodies {
        channel
            .basic_publish(DEFAULT_EXCHANGE, routing_key, body)
            .await?;
    }
    channel.tx_commit().await
}
