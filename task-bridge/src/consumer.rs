//! Flow-controlled task consumer.
//!
//! The [`Dispatcher`] consumes from one queue on the manager's shared channel
//! and spawns a task per delivery. The broker bounds concurrency through the
//! prefetch limit: once that many deliveries are unsettled it withholds the
//! rest.
//!
//! Each delivery is decoded, routed to its handler through the
//! [`TaskRegistry`], and settled exactly once from the handler's [`Outcome`]:
//!
//! ```text
//! received → decode failed            → reject (no requeue)
//!          → handler → Processed      → ack
//!                    → Rejected{..}   → reject (requeue as requested)
//!                    → panic          → reject (requeue)
//! ```
//!
//! When the session is replaced after a connection loss, the dispatcher
//! re-applies prefetch, re-declares its queue and resumes on the new channel.
//! An explicit disconnect ends consumption.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, DeliveryStream, QueueOptions, RawDelivery};
use crate::connection::{ChannelHandle, ConnectionManager, ConnectionState, SessionStatus};
use crate::queue::envelope;
use crate::registry::{Delivery, Outcome, TaskRegistry};

/// Unsettled deliveries allowed per consumer unless configured otherwise.
pub const DEFAULT_PREFETCH: u16 = 10;

const CONSUMER_TAG: &str = "task-bridge";

/// Errors that stop the dispatcher from consuming.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("cannot consume because the connection with RabbitMQ is not established")]
    NotConnected,

    #[error("no queue declared to consume from")]
    NoQueue,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone)]
struct QueueBinding {
    name: String,
    options: QueueOptions,
}

enum Resumed {
    Session(ChannelHandle, DeliveryStream),
    Stopped,
}

/// Consumes tasks from a queue and dispatches them to registered handlers.
pub struct Dispatcher {
    manager: ConnectionManager,
    registry: Arc<TaskRegistry>,
    prefetch: u16,
    queue: Option<QueueBinding>,
}

impl Dispatcher {
    pub fn new(manager: ConnectionManager, registry: Arc<TaskRegistry>) -> Self {
        Self {
            manager,
            registry,
            prefetch: DEFAULT_PREFETCH,
            queue: None,
        }
    }

    /// Set the prefetch limit applied when consumption starts. Zero means no
    /// limit.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Declare `name` on the current channel and remember it as the queue to
    /// consume from. Declaring an existing queue with the same options is a
    /// no-op on the broker.
    pub async fn declare_queue(
        &mut self,
        name: impl Into<String>,
        options: QueueOptions,
    ) -> Result<(), ConsumeError> {
        let name = name.into();
        let handle = self
            .manager
            .channel()
            .await
            .ok_or(ConsumeError::NotConnected)?;

        handle.channel().queue_declare(&name, options).await?;
        info!(
            queue = %name,
            durable = options.durable,
            auto_delete = options.auto_delete,
            "rabbitmq_queue_declared"
        );

        self.queue = Some(QueueBinding { name, options });
        Ok(())
    }

    /// Consume until `shutdown` completes or the manager is disconnected.
    ///
    /// Handler tasks still running when consumption stops are aborted; their
    /// deliveries stay unacknowledged and the broker redelivers them once the
    /// channel closes.
    pub async fn consume<S>(self, shutdown: S) -> Result<(), ConsumeError>
    where
        S: Future<Output = ()>,
    {
        let binding = self.queue.clone().ok_or(ConsumeError::NoQueue)?;
        let mut status = self.manager.subscribe();
        let mut handle = self
            .manager
            .channel()
            .await
            .ok_or(ConsumeError::NotConnected)?;
        let mut deliveries = self.subscribe(&handle, &binding).await?;

        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();
        info!(queue = %binding.name, "consumer_ready");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(queue = %binding.name, "consumer_stopping");
                    break;
                }
                delivery = deliveries.next() => match delivery {
                    Some(Ok(raw)) => self.spawn_delivery(&mut in_flight, &handle, &binding.name, raw),
                    Some(Err(e)) => error!(error = %e, "rabbitmq_delivery_error"),
                    None => {
                        warn!(
                            queue = %binding.name,
                            generation = handle.generation(),
                            "rabbitmq_consumer_closed"
                        );
                        match self
                            .resume(&mut status, &binding, handle.generation(), shutdown.as_mut())
                            .await
                        {
                            Resumed::Session(next, stream) => {
                                handle = next;
                                deliveries = stream;
                            }
                            Resumed::Stopped => break,
                        }
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "task_join_failed");
                    }
                }
            }
        }

        let aborted = in_flight.len();
        in_flight.abort_all();
        info!(queue = %binding.name, aborted_tasks = aborted, "consumer_stopped");
        Ok(())
    }

    /// Apply prefetch, declare the queue and start a consumer on `handle`.
    async fn subscribe(
        &self,
        handle: &ChannelHandle,
        binding: &QueueBinding,
    ) -> Result<DeliveryStream, BrokerError> {
        let channel = handle.channel();
        channel.basic_qos(self.prefetch).await?;
        debug!(prefetch_count = self.prefetch, "rabbitmq_qos_set");

        channel.queue_declare(&binding.name, binding.options).await?;
        let stream = channel.basic_consume(&binding.name, CONSUMER_TAG).await?;
        info!(
            queue = %binding.name,
            generation = handle.generation(),
            "rabbitmq_consumer_started"
        );
        Ok(stream)
    }

    /// Wait for a session newer than `generation` and subscribe on it.
    async fn resume<S>(
        &self,
        status: &mut watch::Receiver<SessionStatus>,
        binding: &QueueBinding,
        mut generation: u64,
        mut shutdown: Pin<&mut S>,
    ) -> Resumed
    where
        S: Future<Output = ()>,
    {
        loop {
            let changed = tokio::select! {
                _ = shutdown.as_mut() => return Resumed::Stopped,
                changed = status.wait_for(|s| {
                    s.state == ConnectionState::Disconnected
                        || (s.state == ConnectionState::Connected && s.generation > generation)
                }) => changed.map(|s| *s),
            };

            match changed {
                Ok(SessionStatus {
                    state: ConnectionState::Connected,
                    ..
                }) => {}
                Ok(_) | Err(_) => {
                    info!(queue = %binding.name, "consumer_session_ended");
                    return Resumed::Stopped;
                }
            }

            let Some(handle) = self.manager.channel().await else {
                continue;
            };
            if handle.generation() <= generation {
                continue;
            }

            match self.subscribe(&handle, binding).await {
                Ok(stream) => return Resumed::Session(handle, stream),
                Err(e) => {
                    warn!(
                        queue = %binding.name,
                        generation = handle.generation(),
                        error = %e,
                        "rabbitmq_resubscribe_failed"
                    );
                    generation = handle.generation();
                }
            }
        }
    }

    fn spawn_delivery(
        &self,
        in_flight: &mut JoinSet<()>,
        handle: &ChannelHandle,
        queue: &str,
        raw: RawDelivery,
    ) {
        debug!(
            queue = %queue,
            delivery_tag = raw.delivery_tag,
            redelivered = raw.redelivered,
            "task_received"
        );

        let registry = Arc::clone(&self.registry);
        let handle = handle.clone();
        let queue = queue.to_string();

        in_flight.spawn(async move {
            let delivery_tag = raw.delivery_tag;
            let outcome = dispatch(&registry, raw).await;

            match settle(&handle, delivery_tag, outcome).await {
                Ok(()) => debug!(
                    queue = %queue,
                    delivery_tag = delivery_tag,
                    outcome = ?outcome,
                    "task_settled"
                ),
                Err(e) => error!(
                    queue = %queue,
                    delivery_tag = delivery_tag,
                    outcome = ?outcome,
                    error = %e,
                    "task_settle_failed"
                ),
            }
        });
    }
}

/// Decode and run one delivery, turning every failure into an [`Outcome`].
async fn dispatch(registry: &TaskRegistry, raw: RawDelivery) -> Outcome {
    let envelope = match envelope::decode(&raw.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                delivery_tag = raw.delivery_tag,
                body_length = raw.body.len(),
                error = %e,
                "task_decode_failed"
            );
            return Outcome::discard();
        }
    };

    let task_type = envelope.kind().to_string();
    let handler = registry.resolve_or_fallback(&task_type);
    let delivery = Delivery {
        envelope,
        delivery_tag: raw.delivery_tag,
        redelivered: raw.redelivered,
    };

    match AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                task_type = %task_type,
                delivery_tag = raw.delivery_tag,
                "task_handler_panicked"
            );
            Outcome::retry()
        }
    }
}

/// Ack or reject on the channel the delivery arrived on. Commits when the
/// channel is transactional, otherwise the settlement would sit in the open
/// transaction.
async fn settle(
    handle: &ChannelHandle,
    delivery_tag: u64,
    outcome: Outcome,
) -> Result<(), BrokerError> {
    let tx = handle.lock_transactions().await;
    let channel = handle.channel();

    match outcome {
        Outcome::Processed => channel.basic_ack(delivery_tag).await?,
        Outcome::Rejected { requeue } => channel.basic_nack(delivery_tag, requeue).await?,
    }
    if tx.selected {
        channel.tx_commit().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use crate::broker::MemoryBroker;
    use crate::queue::Publisher;
    use crate::registry::{handler_fn, FallbackPolicy};
    use crate::tasks::{self, TEST_MESSAGE};
    use crate::test_support::{capture_logs, eventually, memory_manager};

    const QUEUE: &str = "tasks";

    struct Running {
        broker: MemoryBroker,
        manager: ConnectionManager,
        stop: oneshot::Sender<()>,
        task: JoinHandle<Result<(), ConsumeError>>,
    }

    impl Running {
        async fn shutdown(self) -> (MemoryBroker, ConnectionManager) {
            let _ = self.stop.send(());
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .expect("dispatcher did not stop")
                .unwrap()
                .unwrap();
            (self.broker, self.manager)
        }
    }

    async fn start(registry: TaskRegistry, prefetch: u16) -> Running {
        let broker = MemoryBroker::new();
        let manager = memory_manager(&broker);
        manager.connect().await;

        let mut dispatcher =
            Dispatcher::new(manager.clone(), Arc::new(registry)).with_prefetch(prefetch);
        dispatcher
            .declare_queue(QUEUE, QueueOptions::default())
            .await
            .unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(dispatcher.consume(async {
            let _ = stopped.await;
        }));
        eventually(|| broker.consumer_count(QUEUE) == 1).await;

        Running {
            broker,
            manager,
            stop,
            task,
        }
    }

    fn registry_with(tag: &str, handler: impl crate::registry::TaskHandler + 'static) -> TaskRegistry {
        TaskRegistry::builder()
            .handler(tag, handler)
            .fallback_policy(FallbackPolicy::Acknowledge)
            .build()
            .unwrap()
    }

    fn counting(counter: Arc<AtomicUsize>) -> impl crate::registry::TaskHandler {
        handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Outcome::Processed
            }
        })
    }

    fn drained(broker: &MemoryBroker) -> bool {
        broker.queue_depth(QUEUE) == 0 && broker.unacked_count(QUEUE) == 0
    }

    #[tokio::test]
    async fn test_published_test_message_is_logged_and_acknowledged() {
        let (logs, _guard) = capture_logs();
        let running = start(
            tasks::default_registry(FallbackPolicy::Acknowledge).unwrap(),
            DEFAULT_PREFETCH,
        )
        .await;

        let publisher = Publisher::new(running.manager.clone(), QUEUE);
        publisher
            .publish_one(&tasks::test_message("hello"))
            .await
            .unwrap();

        eventually(|| logs.contents().contains("Test task message: hello")).await;
        eventually(|| drained(&running.broker)).await;
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_recognized_task_handled_once_and_acked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let running = start(registry_with("count", counting(Arc::clone(&calls))), 10).await;

        running.broker.inject(QUEUE, r#"{"type": "count", "n": 1}"#);

        eventually(|| drained(&running.broker)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_prefetch_bounds_outstanding_deliveries() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let stuck = handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Outcome>()
        });
        let running = start(registry_with("slow", stuck), 2).await;

        for _ in 0..5 {
            running.broker.inject(QUEUE, r#"{"type": "slow"}"#);
        }

        eventually(|| started.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(running.broker.unacked_count(QUEUE), 2);
        assert_eq!(running.broker.queue_depth(QUEUE), 3);

        // Aborted handlers leave their deliveries to be redelivered.
        let (broker, manager) = running.shutdown().await;
        manager.disconnect().await;
        assert_eq!(broker.queue_depth(QUEUE), 5);
    }

    #[tokio::test]
    async fn test_failed_task_is_redelivered() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let flaky = handler_fn(move |d: Delivery| {
            record.lock().unwrap().push(d.redelivered);
            async move {
                if d.redelivered {
                    Outcome::Processed
                } else {
                    Outcome::retry()
                }
            }
        });
        let running = start(registry_with("flaky", flaky), 10).await;

        running.broker.inject(QUEUE, r#"{"type": "flaky"}"#);

        eventually(|| drained(&running.broker)).await;
        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_discarded_task_is_not_redelivered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let discard = handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Outcome::discard() }
        });
        let running = start(registry_with("bad", discard), 10).await;

        running.broker.inject(QUEUE, r#"{"type": "bad"}"#);

        eventually(|| drained(&running.broker)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrecognized_type_is_acknowledged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let running = start(registry_with("known", counting(Arc::clone(&calls))), 10).await;

        running.broker.inject(QUEUE, r#"{"type": "mystery"}"#);

        eventually(|| drained(&running.broker)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(running.broker.queue_depth(QUEUE), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_body_rejected_and_loop_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let running = start(registry_with(TEST_MESSAGE, counting(Arc::clone(&calls))), 10).await;

        running.broker.inject(QUEUE, "not json");
        running.broker.inject(QUEUE, r#"{"message": "no type"}"#);
        running.broker.inject(QUEUE, r#"{"type": ""}"#);
        running
            .broker
            .inject(QUEUE, r#"{"type": "test_message", "message": "ok"}"#);

        eventually(|| calls.load(Ordering::SeqCst) == 1).await;
        eventually(|| drained(&running.broker)).await;
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_is_requeued() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let panicky = handler_fn(move |d: Delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if !d.redelivered {
                    panic!("handler blew up");
                }
                Outcome::Processed
            }
        });
        let running = start(registry_with("boom", panicky), 10).await;

        running.broker.inject(QUEUE, r#"{"type": "boom"}"#);

        eventually(|| drained(&running.broker)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_resumes_after_connection_loss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let running = start(registry_with("count", counting(Arc::clone(&calls))), 10).await;

        running.broker.sever_connections();
        let mut status = running.manager.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == ConnectionState::Connected && s.generation >= 2),
        )
        .await
        .unwrap()
        .unwrap();
        eventually(|| running.broker.consumer_count(QUEUE) == 1).await;

        running.broker.inject(QUEUE, r#"{"type": "count"}"#);

        eventually(|| calls.load(Ordering::SeqCst) == 1).await;
        eventually(|| drained(&running.broker)).await;
        let (_broker, manager) = running.shutdown().await;
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_stops_consumption() {
        let calls = Arc::new(AtomicUsize::new(0));
        let running = start(registry_with("count", counting(calls)), 10).await;

        running.manager.disconnect().await;

        let result = tokio::time::timeout(Duration::from_secs(5), running.task)
            .await
            .expect("dispatcher kept running after disconnect")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_consume_requires_connection_and_queue() {
        let broker = MemoryBroker::new();
        let manager = memory_manager(&broker);
        let registry = Arc::new(tasks::default_registry(FallbackPolicy::Acknowledge).unwrap());

        let mut dispatcher = Dispatcher::new(manager.clone(), Arc::clone(&registry));
        assert!(matches!(
            dispatcher.declare_queue(QUEUE, QueueOptions::default()).await,
            Err(ConsumeError::NotConnected)
        ));

        manager.connect().await;
        let dispatcher = Dispatcher::new(manager.clone(), registry);
        assert_eq!(dispatcher.prefetch(), DEFAULT_PREFETCH);
        assert!(matches!(
            dispatcher.consume(async {}).await,
            Err(ConsumeError::NoQueue)
        ));
        manager.disconnect().await;
    }
}
