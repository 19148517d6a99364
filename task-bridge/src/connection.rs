//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns the one connection and the one channel shared by
//! the publisher and the consumer. After a successful [`connect`], a supervisor
//! task watches both and transparently re-establishes them with exponential
//! backoff when the broker goes away, so callers never see transient network
//! errors.
//!
//! Every (re)connection bumps a session generation, published together with
//! the [`ConnectionState`] on a watch channel so the consumer can resubscribe
//! on the new channel.
//!
//! [`connect`]: ConnectionManager::connect

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{AmqpConnector, BrokerChannel, BrokerConnection, BrokerError, Connector};

/// Lifecycle state of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The session was lost and reconnection is in progress.
    Failed,
}

/// State plus the generation of the session it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

/// How the supervisor detects and recovers from a lost session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Interval between liveness checks of the connection and channel.
    pub health_check_interval: Duration,
    /// Delay before the second reconnection attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }

    /// Spread `delay` by up to 15% either way.
    fn jittered(delay: Duration) -> Duration {
        // ThreadRng is not Send, keep it out of any await.
        let factor = rand::thread_rng().gen_range(0.85..=1.15);
        delay.mul_f64(factor)
    }
}

/// Channel-scoped transaction bookkeeping.
#[derive(Debug, Default)]
pub struct TxMode {
    /// `tx.select` was issued on this channel.
    pub selected: bool,
}

/// The open channel of the current session.
///
/// Transactions are channel-scoped in AMQP: once the publisher has put the
/// channel in transactional mode, acknowledgements issued on it only take
/// effect on commit. Publishing batches and settling deliveries therefore both
/// go through [`lock_transactions`](Self::lock_transactions).
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn BrokerChannel>,
    tx: Arc<AsyncMutex<TxMode>>,
    generation: u64,
}

impl ChannelHandle {
    fn new(channel: Arc<dyn BrokerChannel>, generation: u64) -> Self {
        Self {
            channel,
            tx: Arc::new(AsyncMutex::new(TxMode::default())),
            generation,
        }
    }

    pub fn channel(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Serialize transactional work on this channel.
    pub async fn lock_transactions(&self) -> MutexGuard<'_, TxMode> {
        self.tx.lock().await
    }
}

#[derive(Default)]
struct Session {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<ChannelHandle>,
}

impl Session {
    fn is_open(&self) -> bool {
        match (&self.connection, &self.channel) {
            (Some(connection), Some(channel)) => connection.is_open() && channel.is_open(),
            _ => false,
        }
    }
}

/// Owner of the broker connection and its channel.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    endpoint: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    session: RwLock<Session>,
    status: watch::Sender<SessionStatus>,
    generation: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager that reaches `endpoint` through `connector`. Nothing is
    /// opened until [`connect`](Self::connect).
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: ConnectionState::Disconnected,
            generation: 0,
        });

        Self {
            inner: Arc::new(ManagerInner {
                endpoint: endpoint.into(),
                connector,
                policy,
                session: RwLock::new(Session::default()),
                status,
                generation: AtomicU64::new(0),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Create a manager for an `amqp://` URL using lapin.
    pub fn amqp(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self::new(url, Arc::new(AmqpConnector), policy)
    }

    /// Open the connection and its channel.
    ///
    /// An existing session stays usable while the new one is opened and is
    /// closed once the attempt finishes. If the attempt fails, the failure is
    /// logged and the manager ends up disconnected; check [`status`] to find
    /// out. Once connected, losses are recovered in the background.
    ///
    /// [`status`]: Self::status
    pub async fn connect(&self) {
        self.stop_supervisor();

        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner
            .set_status(ConnectionState::Connecting, generation);
        info!(
            endpoint_length = self.inner.endpoint.len(),
            "rabbitmq_connecting"
        );

        let opened = self.inner.open_session().await;

        let mut session = self.inner.session.write().await;
        if session.connection.is_some() || session.channel.is_some() {
            info!("rabbitmq_replacing_session");
            close_session(&mut session).await;
        }

        match opened {
            Ok((connection, channel)) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                session.connection = Some(connection);
                session.channel = Some(ChannelHandle::new(channel, generation));
                self.inner
                    .set_status(ConnectionState::Connected, generation);
                drop(session);

                info!(generation = generation, "rabbitmq_connected");
                self.start_supervisor();
            }
            Err(e) => {
                error!(error = %e, "rabbitmq_connect_failed");
                *session = Session::default();
                self.inner
                    .set_status(ConnectionState::Disconnected, generation);
            }
        }
    }

    /// Close the channel, then the connection. Always clears both, even if
    /// closing fails. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.stop_supervisor();

        let mut session = self.inner.session.write().await;
        close_session(&mut session).await;

        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner
            .set_status(ConnectionState::Disconnected, generation);
        info!("rabbitmq_disconnected");
    }

    /// `true` only when both the connection and the channel are open.
    pub async fn status(&self) -> bool {
        self.inner.session.read().await.is_open()
    }

    /// Last published lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// Follow lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// The channel of the current session, if it is open.
    pub async fn channel(&self) -> Option<ChannelHandle> {
        let session = self.inner.session.read().await;
        if !session.is_open() {
            return None;
        }
        session.channel.clone()
    }

    fn start_supervisor(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(supervise(weak));
        let previous = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_supervisor(&self) {
        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("rabbitmq_supervisor_stopped");
        }
    }
}

impl ManagerInner {
    fn set_status(&self, state: ConnectionState, generation: u64) {
        self.status.send_replace(SessionStatus { state, generation });
    }

    /// Open a connection and a channel on it. A connection whose channel
    /// cannot be created is closed again.
    async fn open_session(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), BrokerError> {
        let connection = self.connector.open(&self.endpoint).await?;
        match connection.create_channel().await {
            Ok(channel) => Ok((connection, channel)),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "rabbitmq_partial_connection_close_error");
                }
                Err(e)
            }
        }
    }
}

/// Close the channel before the connection, logging failures, and clear both.
async fn close_session(session: &mut Session) {
    if let Some(handle) = session.channel.take() {
        if handle.is_open() {
            if let Err(e) = handle.channel().close().await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }
    }

    if let Some(connection) = session.connection.take() {
        if connection.is_open() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }
    }
}

/// Watch the session and re-establish it when it drops.
///
/// Holds only a weak reference so a dropped manager ends the task.
async fn supervise(weak: Weak<ManagerInner>) {
    let interval = match weak.upgrade() {
        Some(inner) => inner.policy.health_check_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        if inner.session.read().await.is_open() {
            continue;
        }
        let generation = {
            let mut session = inner.session.write().await;
            if session.is_open() {
                continue;
            }
            close_session(&mut session).await;
            inner.generation.load(Ordering::SeqCst)
        };

        warn!(generation = generation, "rabbitmq_connection_lost");
        inner.set_status(ConnectionState::Failed, generation);
        drop(inner);

        if !reconnect(&weak).await {
            return;
        }
    }
}

/// Retry until a new session is installed. Returns `false` if the manager was
/// dropped meanwhile.
async fn reconnect(weak: &Weak<ManagerInner>) -> bool {
    let mut attempt: u32 = 0;
    let mut delay = match weak.upgrade() {
        Some(inner) => inner.policy.initial_backoff,
        None => return false,
    };

    loop {
        let Some(inner) = weak.upgrade() else {
            return false;
        };
        attempt += 1;
        let generation = inner.generation.load(Ordering::SeqCst);
        inner.set_status(ConnectionState::Connecting, generation);

        let opened = inner.open_session().await;
        match opened {
            Ok((connection, channel)) => {
                let mut session = inner.session.write().await;
                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                session.connection = Some(connection);
                session.channel = Some(ChannelHandle::new(channel, generation));
                inner.set_status(ConnectionState::Connected, generation);
                info!(
                    attempt = attempt,
                    generation = generation,
                    "rabbitmq_reconnected"
                );
                return true;
            }
            Err(e) => {
                let wait = ReconnectPolicy::jittered(delay);
                warn!(
                    attempt = attempt,
                    error = %e,
                    retry_in_ms = wait.as_millis() as u64,
                    "rabbitmq_reconnect_failed"
                );
                inner.set_status(ConnectionState::Failed, generation);
                delay = inner.policy.next_backoff(delay);
                drop(inner);
                sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::broker::MemoryBroker;
    use crate::test_support::fast_policy;

    fn manager(broker: &MemoryBroker) -> ConnectionManager {
        ConnectionManager::new("memory://test", Arc::new(broker.clone()), fast_policy())
    }

    async fn wait_for_generation(manager: &ConnectionManager, generation: u64) {
        let mut status = manager.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == ConnectionState::Connected && s.generation >= generation),
        )
        .await
        .expect("timed out waiting for reconnection")
        .unwrap();
    }

    #[tokio::test]
    async fn test_status_follows_connect_and_disconnect() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        assert!(!manager.status().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await;
        assert!(manager.status().await);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_channels(), 1);

        manager.disconnect().await;
        assert!(!manager.status().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.disconnect().await;
        manager.connect().await;
        manager.disconnect().await;
        manager.disconnect().await;
        assert!(!manager.status().await);
        assert!(manager.channel().await.is_none());
    }

    #[tokio::test]
    async fn test_initial_failure_resets_to_disconnected() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let manager = manager(&broker);

        manager.connect().await;
        assert!(!manager.status().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.channel().await.is_none());
        assert_eq!(broker.open_channels(), 0);

        // No background retries after a failed initial attempt.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_twice_does_not_leak_channel() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);

        manager.connect().await;
        let first = manager.channel().await.unwrap();
        manager.connect().await;
        let second = manager.channel().await.unwrap();

        assert!(!first.is_open());
        assert!(second.is_open());
        assert!(second.generation() > first.generation());
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_status_false_when_only_channel_closed() {
        let broker = MemoryBroker::new();
        let policy = ReconnectPolicy {
            health_check_interval: Duration::from_secs(3600),
            ..fast_policy()
        };
        let manager = ConnectionManager::new("memory://test", Arc::new(broker.clone()), policy);
        manager.connect().await;

        manager
            .channel()
            .await
            .unwrap()
            .channel()
            .close()
            .await
            .unwrap();

        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_channels(), 0);
        assert!(!manager.status().await);
        assert!(manager.channel().await.is_none());
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_clears_session_when_close_fails() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;

        // The channel close fails; the connection close still runs.
        broker.fail_next_close();
        manager.disconnect().await;

        assert!(!manager.status().await);
        assert!(manager.channel().await.is_none());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_channels(), 0);
    }

    /// Holds every `open` until a permit is added.
    struct GatedConnector {
        broker: MemoryBroker,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn open(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
            self.gate.acquire().await.unwrap().forget();
            self.broker.open(endpoint).await
        }
    }

    #[tokio::test]
    async fn test_session_stays_readable_while_reconnecting() {
        let broker = MemoryBroker::new();
        let gate = Arc::new(Semaphore::new(1));
        let connector = GatedConnector {
            broker: broker.clone(),
            gate: Arc::clone(&gate),
        };
        let manager = ConnectionManager::new("memory://test", Arc::new(connector), fast_policy());
        manager.connect().await;
        assert!(manager.status().await);

        let reconnecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        let mut status = manager.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == ConnectionState::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        let readable = tokio::time::timeout(Duration::from_millis(200), async {
            (manager.status().await, manager.channel().await.is_some())
        })
        .await;
        assert_eq!(readable.ok(), Some((true, true)));

        gate.add_permits(1);
        reconnecting.await.unwrap();
        assert!(manager.status().await);
        assert_eq!(manager.channel().await.unwrap().generation(), 2);
        assert_eq!(broker.open_connections(), 1);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;
        let before = manager.channel().await.unwrap().generation();

        broker.sever_connections();
        wait_for_generation(&manager, before + 1).await;

        assert!(manager.status().await);
        assert_eq!(broker.open_channels(), 1);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_keeps_retrying_while_broker_unreachable() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;

        broker.set_reachable(false);
        broker.sever_connections();

        let mut status = manager.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == ConnectionState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!manager.status().await);
        assert!(manager.channel().await.is_none());

        // Several refused attempts, then recovery.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(broker.connect_attempts() >= 3);
        broker.set_reachable(true);
        wait_for_generation(&manager, 2).await;
        assert!(manager.status().await);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_stops_reconnection() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;
        manager.disconnect().await;

        let attempts = broker.connect_attempts();
        broker.sever_connections();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connect_attempts(), attempts);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let mut delay = policy.initial_backoff;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = policy.next_backoff(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_stays_within_fifteen_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = ReconnectPolicy::jittered(base);
            assert!(jittered >= Duration::from_millis(849));
            assert!(jittered <= Duration::from_millis(1151));
        }
    }
}
