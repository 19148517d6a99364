//! In-process reference broker.
//!
//! Models the parts of AMQP 0-9-1 the bridge relies on:
//!
//! - default-exchange routing by queue name (unroutable messages are dropped)
//! - durable / auto-delete queues, with inequivalent redeclaration rejected
//! - per-channel prefetch: deliveries are withheld while a channel is at its
//!   unacknowledged limit
//! - ack, and nack with or without requeue (requeued messages come back first,
//!   flagged as redelivered)
//! - channel-scoped transactions: once `tx.select` is issued, publishes and
//!   settlements on the channel are held until `tx.commit`
//! - unacknowledged deliveries are requeued when their channel or connection
//!   closes
//!
//! Fault injection hooks let tests refuse connections, sever live ones, and
//! abort the next commit.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnection, BrokerError, Connector, DeliveryStream, QueueOptions,
    RawDelivery,
};

/// Handle to a shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    fail_next_commit: bool,
    fail_next_close: bool,
    connect_attempts: u64,
    next_id: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueEntry>,
}

#[derive(Default)]
struct ConnectionEntry {
    channels: Vec<u64>,
}

struct ChannelEntry {
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    tx: Option<TxBuffer>,
}

impl ChannelEntry {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

struct Unacked {
    queue: String,
    body: Vec<u8>,
}

#[derive(Default)]
struct TxBuffer {
    publishes: Vec<(String, Vec<u8>)>,
    settlements: Vec<Settlement>,
}

#[derive(Clone, Copy)]
enum Settlement {
    Ack(u64),
    Nack(u64, bool),
}

impl Settlement {
    fn delivery_tag(self) -> u64 {
        match self {
            Settlement::Ack(tag) | Settlement::Nack(tag, _) => tag,
        }
    }
}

struct QueueEntry {
    options: QueueOptions,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerEntry {
    channel: u64,
    tag: String,
    sender: UnboundedSender<Result<RawDelivery, BrokerError>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Drop every live connection, as a network partition would.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
        debug!("memory_broker_connections_severed");
    }

    /// Make the next `tx.commit` on any channel fail and discard its buffer.
    pub fn fail_next_commit(&self) {
        self.lock().fail_next_commit = true;
    }

    /// Make the next channel or connection `close` fail and leave the handle
    /// open.
    pub fn fail_next_close(&self) {
        self.lock().fail_next_close = true;
    }

    /// Number of connection attempts seen, including refused ones.
    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    /// Declare a queue out of band.
    pub fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.lock().declare_queue(queue, options)
    }

    /// Enqueue a raw body directly, bypassing channels and transactions.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.lock().route(queue, body.into());
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages ready for delivery (not counting unacknowledged ones).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Bodies of the ready messages, in delivery order.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries from `queue` handed out and not yet settled, across channels.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelEntry, BrokerError> {
        self.channels.get_mut(&id).ok_or(BrokerError::ChannelClosed)
    }

    fn declare_queue(&mut self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        if let Some(existing) = self.queues.get(queue) {
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{queue}'"
                )));
            }
            return Ok(());
        }

        self.queues.insert(
            queue.to_string(),
            QueueEntry {
                options,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(())
    }

    fn route(&mut self, routing_key: &str, body: Vec<u8>) {
        match self.queues.get_mut(routing_key) {
            Some(queue) => {
                queue.ready.push_back(Message {
                    body,
                    redelivered: false,
                });
                self.pump(routing_key);
            }
            None => debug!(routing_key = %routing_key, "memory_broker_unroutable"),
        }
    }

    /// Hand ready messages to consumers round-robin until the queue is empty
    /// or every consumer's channel is at its prefetch limit.
    fn pump(&mut self, queue: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(entry) = queues.get_mut(queue) else {
            return;
        };

        loop {
            if entry.ready.is_empty() {
                return;
            }
            entry.consumers.retain(|c| !c.sender.is_closed());
            let count = entry.consumers.len();
            if count == 0 {
                return;
            }

            let mut progressed = false;
            for offset in 0..count {
                let index = (entry.next_consumer + offset) % count;
                let Some(channel) = channels.get_mut(&entry.consumers[index].channel) else {
                    continue;
                };
                if !channel.has_capacity() {
                    continue;
                }
                let Some(message) = entry.ready.pop_front() else {
                    return;
                };

                channel.next_tag += 1;
                let delivery = RawDelivery {
                    delivery_tag: channel.next_tag,
                    redelivered: message.redelivered,
                    body: message.body.clone(),
                };
                let delivery_tag = delivery.delivery_tag;

                if entry.consumers[index]
                    .sender
                    .unbounded_send(Ok(delivery))
                    .is_err()
                {
                    // Receiver dropped; the retain above removes it next pass.
                    entry.ready.push_front(message);
                } else {
                    channel.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue: queue.to_string(),
                            body: message.body,
                        },
                    );
                    entry.next_consumer = (index + 1) % count;
                }
                progressed = true;
                break;
            }

            if !progressed {
                return;
            }
        }
    }

    fn settle(&mut self, channel_id: u64, settlement: Settlement) -> Result<(), BrokerError> {
        let channel = self.channel_mut(channel_id)?;
        let delivery_tag = settlement.delivery_tag();
        if !channel.unacked.contains_key(&delivery_tag) {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        }
        if let Some(tx) = channel.tx.as_mut() {
            tx.settlements.push(settlement);
            return Ok(());
        }
        self.apply_settlement(channel_id, settlement)
    }

    fn apply_settlement(&mut self, channel_id: u64, settlement: Settlement) -> Result<(), BrokerError> {
        let delivery_tag = settlement.delivery_tag();
        let unacked = self
            .channel_mut(channel_id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;

        if let Settlement::Nack(_, true) = settlement {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(Message {
                    body: unacked.body,
                    redelivered: true,
                });
            }
        }
        self.pump(&unacked.queue);
        Ok(())
    }

    fn publish(&mut self, channel_id: u64, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let channel = self.channel_mut(channel_id)?;
        if let Some(tx) = channel.tx.as_mut() {
            tx.publishes.push((routing_key.to_string(), body.to_vec()));
            return Ok(());
        }
        self.route(routing_key, body.to_vec());
        Ok(())
    }

    fn commit(&mut self, channel_id: u64) -> Result<(), BrokerError> {
        let channel = self.channel_mut(channel_id)?;
        let buffer = match channel.tx.as_mut() {
            Some(tx) => std::mem::take(tx),
            None => {
                return Err(BrokerError::PreconditionFailed(
                    "channel is not transactional".to_string(),
                ))
            }
        };

        if std::mem::take(&mut self.fail_next_commit) {
            return Err(BrokerError::TransactionAborted(
                "commit refused by broker".to_string(),
            ));
        }

        for (routing_key, body) in buffer.publishes {
            self.route(&routing_key, body);
        }
        for settlement in buffer.settlements {
            self.apply_settlement(channel_id, settlement)?;
        }
        Ok(())
    }

    fn rollback(&mut self, channel_id: u64) -> Result<(), BrokerError> {
        match self.channel_mut(channel_id)?.tx.as_mut() {
            Some(tx) => {
                *tx = TxBuffer::default();
                Ok(())
            }
            None => Err(BrokerError::PreconditionFailed(
                "channel is not transactional".to_string(),
            )),
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        if let Some(connection) = self.connections.get_mut(&channel.connection) {
            connection.channels.retain(|c| *c != id);
        }

        let mut touched = Vec::new();
        // Highest tag first so the oldest delivery ends up at the head.
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(Message {
                    body: unacked.body,
                    redelivered: true,
                });
            }
            touched.push(unacked.queue);
        }

        let mut deleted = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            for consumer in queue.consumers.iter().filter(|c| c.channel == id) {
                debug!(queue = %name, consumer_tag = %consumer.tag, "memory_broker_consumer_cancelled");
            }
            queue.consumers.retain(|c| c.channel != id);
            if queue.consumers.len() != before {
                if queue.consumers.is_empty() && queue.options.auto_delete {
                    deleted.push(name.clone());
                } else {
                    touched.push(name.clone());
                }
            }
        }
        for name in &deleted {
            self.queues.remove(name);
            debug!(queue = %name, "memory_broker_queue_auto_deleted");
        }

        touched.sort();
        touched.dedup();
        for name in touched {
            self.pump(&name);
        }
    }

    fn close_connection(&mut self, id: u64) {
        if let Some(connection) = self.connections.remove(&id) {
            for channel in connection.channels {
                self.close_channel(channel);
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(BrokerError::Unreachable(format!(
                "connection refused: {endpoint}"
            )));
        }

        let id = state.allocate_id();
        state.connections.insert(id, ConnectionEntry::default());
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                tx: None,
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(id);
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        if std::mem::take(&mut state.fail_next_close) {
            return Err(BrokerError::Unreachable("close-ok not received".to_string()));
        }
        state.close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(BrokerError::ChannelClosed);
        }
        if std::mem::take(&mut state.fail_next_close) {
            return Err(BrokerError::Unreachable("close-ok not received".to_string()));
        }
        state.close_channel(self.id);
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.broker.lock().channel_mut(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        state.declare_queue(queue, options)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.id)?;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;

        let (sender, receiver) = mpsc::unbounded();
        entry.consumers.push(ConsumerEntry {
            channel: self.id,
            tag: consumer_tag.to_string(),
            sender,
        });
        debug!(queue = %queue, consumer_tag = %consumer_tag, "memory_broker_consumer_registered");
        state.pump(queue);

        Ok(receiver.boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        if !exchange.is_empty() {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        self.broker.lock().publish(self.id, routing_key, body)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .settle(self.id, Settlement::Ack(delivery_tag))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .settle(self.id, Settlement::Nack(delivery_tag, requeue))
    }

    async fn tx_select(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let channel = state.channel_mut(self.id)?;
        if channel.tx.is_none() {
            channel.tx = Some(TxBuffer::default());
        }
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), BrokerError> {
        self.broker.lock().commit(self.id)
    }

    async fn tx_rollback(&self) -> Result<(), BrokerError> {
        self.broker.lock().rollback(self.id)
    }
}
