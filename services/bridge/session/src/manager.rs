//! Connection manager owning one physical link's lifecycle.
//!
//! The manager runs the handshake with retry, spawns the packet router once
//! connected, and recovers lost links through a single coalesced reconnect
//! task. Every transition happens under the state lock; sends check the state
//! under the lock and perform their I/O after releasing it.
//!
//! A disconnect bumps an epoch counter under the state lock. Handshakes and
//! reconnects started before it compare epochs before publishing
//! `Connected`, so a link never reports connected after `disconnect()`
//! returns.

use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::handshake::{hex, perform_handshake, Credentials, Established};
use crate::metrics::{
    MetricsSink, CONNECTION_HANDSHAKE, CONNECTION_HANDSHAKE_RETRY_DELAY_MS, CONNECTION_RECONNECT,
};
use crate::pending::PendingQueue;
use crate::router::{self, RoutedFrame};
use crate::state::{ConnectionState, StateCell};
use crate::transport::{BoxedStream, Connector};

/// Counters describing one link since creation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Frames decoded by the router
    pub frames_in: u64,
    /// Frames written to the socket
    pub frames_out: u64,
    /// Raw bytes read
    pub bytes_in: u64,
    /// Raw bytes written
    pub bytes_out: u64,
    /// Malformed frames skipped
    pub decode_errors: u64,
    /// Reconnect runs started
    pub reconnects: u64,
    /// Most recent heartbeat round trip
    pub last_heartbeat_rtt: Option<Duration>,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) frames_in: AtomicU64,
    pub(crate) frames_out: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    /// Microseconds; zero means no heartbeat was acknowledged yet
    pub(crate) last_rtt_us: AtomicU64,
}

#[derive(Debug)]
struct ReconnectTask {
    abort: AbortHandle,
    done: watch::Receiver<Option<bool>>,
}

impl ReconnectTask {
    fn finished(&self) -> bool {
        self.done.borrow().is_some() || self.abort.is_finished()
    }
}

/// Observer for a reconnect run
#[derive(Debug)]
pub struct ReconnectHandle {
    done: watch::Receiver<Option<bool>>,
    started: bool,
}

impl ReconnectHandle {
    /// False when this trigger joined a reconnect that was already running
    pub fn started(&self) -> bool {
        self.started
    }

    /// Wait for the run to finish; true when it ended connected
    pub async fn wait(mut self) -> bool {
        loop {
            if let Some(result) = *self.done.borrow_and_update() {
                return result;
            }
            if self.done.changed().await.is_err() {
                // Task cancelled before publishing a result
                return self.done.borrow().unwrap_or(false);
            }
        }
    }
}

pub(crate) struct Shared {
    pub(crate) id: String,
    connector: Arc<dyn Connector>,
    pub(crate) config: ConnectionConfig,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    state: StateCell,
    epoch: AtomicU64,
    credentials: Mutex<Option<Credentials>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    pub(crate) pending: PendingQueue,
    pub(crate) data_tx: mpsc::Sender<RoutedFrame>,
    data_rx: tokio::sync::Mutex<mpsc::Receiver<RoutedFrame>>,
    router: Mutex<Option<JoinHandle<Result<(), ConnectionError>>>>,
    reconnect: Mutex<Option<ReconnectTask>>,
    pub(crate) stats: StatCounters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one managed connection; clones share the same link
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.shared.id)
            .field("target", &self.shared.connector.describe())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager in `Disconnected` state
    pub fn new(
        id: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let id = id.into();
        let (data_tx, data_rx) = mpsc::channel(config.queue_capacity());
        let state = StateCell::new(
            id.clone(),
            config.timeouts.lock_hold_warn,
            config.timeouts.lock_hold_critical,
            metrics.clone(),
        );
        Self {
            shared: Arc::new(Shared {
                id,
                connector,
                config,
                metrics,
                state,
                epoch: AtomicU64::new(0),
                credentials: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                pending: PendingQueue::new(),
                data_tx,
                data_rx: tokio::sync::Mutex::new(data_rx),
                router: Mutex::new(None),
                reconnect: Mutex::new(None),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Identifier used in logs
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Configuration this manager was built with
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Endpoint id stored by the last `connect` call
    pub fn endpoint(&self) -> Option<[u8; 4]> {
        lock(&self.shared.credentials).as_ref().map(|c| c.endpoint)
    }

    /// Outstanding ACK waiters
    pub fn pending(&self) -> &PendingQueue {
        &self.shared.pending
    }

    /// Last published state, read without the lock.
    ///
    /// Suitable for logs and dashboards only. Use
    /// [`with_state_check`](Self::with_state_check) to gate I/O.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.snapshot()
    }

    /// Best-effort lock-free check; see [`state`](Self::state)
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Snapshot of the link counters
    pub fn stats(&self) -> ConnectionStats {
        let s = &self.shared.stats;
        let rtt_us = s.last_rtt_us.load(Ordering::Relaxed);
        ConnectionStats {
            frames_in: s.frames_in.load(Ordering::Relaxed),
            frames_out: s.frames_out.load(Ordering::Relaxed),
            bytes_in: s.bytes_in.load(Ordering::Relaxed),
            bytes_out: s.bytes_out.load(Ordering::Relaxed),
            decode_errors: s.decode_errors.load(Ordering::Relaxed),
            reconnects: s.reconnects.load(Ordering::Relaxed),
            last_heartbeat_rtt: (rtt_us > 0).then(|| Duration::from_micros(rtt_us)),
        }
    }

    /// Connect and authenticate as `endpoint`.
    ///
    /// Returns `Ok(true)` once connected (immediately if already connected),
    /// `Ok(false)` when every attempt failed or a disconnect interrupted the
    /// handshake, and `Err` for non-retryable failures such as a rejected
    /// auth code.
    pub async fn connect(
        &self,
        endpoint: [u8; 4],
        auth_code: impl Into<Bytes>,
    ) -> Result<bool, ConnectionError> {
        let credentials = Credentials {
            endpoint,
            auth_code: auth_code.into(),
        };
        *lock(&self.shared.credentials) = Some(credentials.clone());

        let epoch = {
            let mut state = self.shared.state.lock().await;
            match *state {
                ConnectionState::Connected => return Ok(true),
                ConnectionState::Connecting => {
                    warn!(connection = %self.shared.id, "connect already in progress");
                    return Ok(false);
                }
                ConnectionState::Reconnecting => None,
                ConnectionState::Disconnected => {
                    state.set(ConnectionState::Connecting);
                    Some(self.shared.epoch.load(Ordering::SeqCst))
                }
            }
        };

        let Some(epoch) = epoch else {
            info!(connection = %self.shared.id, "connect joining in-flight reconnect");
            let in_flight = lock(&self.shared.reconnect)
                .as_ref()
                .map(|task| task.done.clone());
            return Ok(match in_flight {
                Some(done) => ReconnectHandle { done, started: false }.wait().await,
                None => false,
            });
        };

        info!(
            connection = %self.shared.id,
            target_desc = %self.shared.connector.describe(),
            endpoint = %hex(&endpoint),
            "connecting"
        );
        let result = self.establish(&credentials, epoch).await;
        if !matches!(result, Ok(true)) {
            self.settle_disconnected(epoch).await;
        }
        result
    }

    /// Handshake with retry; publishes `Connected` on success
    async fn establish(
        &self,
        credentials: &Credentials,
        epoch: u64,
    ) -> Result<bool, ConnectionError> {
        let shared = &self.shared;
        let policy = &shared.config.retry;
        let attempts = policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = policy.delay_for(attempt - 2);
                shared.metrics.observe(
                    CONNECTION_HANDSHAKE_RETRY_DELAY_MS,
                    delay.as_secs_f64() * 1000.0,
                    &[],
                );
                debug!(connection = %shared.id, attempt, ?delay, "backing off before handshake retry");
                tokio::time::sleep(delay).await;
            }
            if self.superseded(epoch) {
                return Ok(false);
            }

            match perform_handshake(
                shared.connector.as_ref(),
                credentials,
                &shared.pending,
                shared.config.timeouts.handshake,
            )
            .await
            {
                Ok(established) => {
                    shared
                        .metrics
                        .increment(CONNECTION_HANDSHAKE, &[("outcome", "success")]);
                    return self.activate(established, epoch).await;
                }
                Err(e) if !e.is_retryable() => {
                    shared
                        .metrics
                        .increment(CONNECTION_HANDSHAKE, &[("outcome", e.kind())]);
                    error!(connection = %shared.id, attempt, error = %e, "handshake failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    shared
                        .metrics
                        .increment(CONNECTION_HANDSHAKE, &[("outcome", e.kind())]);
                    warn!(connection = %shared.id, attempt, max_attempts = attempts, error = %e, "handshake attempt failed");
                }
            }
        }

        warn!(connection = %shared.id, attempts, "handshake retries exhausted");
        Ok(false)
    }

    /// Install a handshaken socket and start its router
    async fn activate(&self, established: Established, epoch: u64) -> Result<bool, ConnectionError> {
        let Established {
            reader,
            writer,
            framer,
            backlog,
        } = established;

        let mut state = self.shared.state.lock().await;
        if self.superseded(epoch) {
            drop(state);
            debug!(connection = %self.shared.id, "disconnected during handshake; discarding socket");
            let mut writer = writer;
            let _ = writer.shutdown().await;
            return Ok(false);
        }

        *self.shared.writer.lock().await = Some(writer);
        let handle = router::spawn(self.clone(), reader, framer, backlog, epoch);
        *lock(&self.shared.router) = Some(handle);
        state.set(ConnectionState::Connected);
        drop(state);

        info!(connection = %self.shared.id, "connected");
        Ok(true)
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.shared.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn settle_disconnected(&self, epoch: u64) {
        let mut state = self.shared.state.lock().await;
        if !self.superseded(epoch) {
            state.set(ConnectionState::Disconnected);
        }
    }

    /// Tear the link down and cancel any reconnect in flight
    pub async fn disconnect(&self) {
        {
            let mut state = self.shared.state.lock().await;
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            state.set(ConnectionState::Disconnected);
        }
        self.teardown(true).await;
        info!(connection = %self.shared.id, "disconnected");
    }

    /// Release socket resources: router first, then reconnect task, then socket.
    /// The pending queue is always cleared.
    async fn teardown(&self, cancel_reconnect: bool) {
        let router = lock(&self.shared.router).take();
        if let Some(handle) = router {
            handle.abort();
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(connection = %self.shared.id, error = %e, "router had exited with error"),
                Err(e) if e.is_cancelled() => debug!(connection = %self.shared.id, "router cancelled"),
                Err(e) => warn!(connection = %self.shared.id, "router task failed: {}", e),
            }
        }

        if cancel_reconnect {
            if let Some(task) = lock(&self.shared.reconnect).take() {
                task.abort.abort();
            }
        }

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(self.shared.config.timeouts.write, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(connection = %self.shared.id, "socket close failed: {}", e),
                Err(_) => debug!(connection = %self.shared.id, "socket close timed out"),
            }
        }

        self.shared.pending.clear();
    }

    /// Start a reconnect, or join the one already running
    pub fn trigger_reconnect(&self, reason: &str) -> Result<ReconnectHandle, ConnectionError> {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.spawn_reconnect(reason, epoch)
    }

    /// Reconnect and wait for the outcome; true when connected again
    pub async fn reconnect(&self, reason: &str) -> Result<bool, ConnectionError> {
        Ok(self.trigger_reconnect(reason)?.wait().await)
    }

    pub(crate) fn spawn_reconnect(
        &self,
        reason: &str,
        epoch: u64,
    ) -> Result<ReconnectHandle, ConnectionError> {
        let credentials = lock(&self.shared.credentials)
            .clone()
            .ok_or(ConnectionError::NoCredentials)?;

        let mut slot = lock(&self.shared.reconnect);
        if let Some(task) = slot.as_ref() {
            if !task.finished() {
                info!(connection = %self.shared.id, reason, "reconnect already in flight; coalescing");
                return Ok(ReconnectHandle {
                    done: task.done.clone(),
                    started: false,
                });
            }
        }

        let (tx, rx) = watch::channel(None);
        let manager = self.clone();
        let reason_owned = reason.to_string();
        let handle = tokio::spawn(async move {
            let connected = manager.run_reconnect(&reason_owned, credentials, epoch).await;
            let _ = tx.send(Some(connected));
        });
        *slot = Some(ReconnectTask {
            abort: handle.abort_handle(),
            done: rx.clone(),
        });

        Ok(ReconnectHandle {
            done: rx,
            started: true,
        })
    }

    async fn run_reconnect(&self, reason: &str, credentials: Credentials, epoch: u64) -> bool {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().await;
            if self.superseded(epoch) {
                debug!(connection = %shared.id, reason, "reconnect skipped; link was disconnected");
                return false;
            }
            state.set(ConnectionState::Reconnecting);
        }
        shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        warn!(connection = %shared.id, reason, "reconnecting");

        self.teardown(false).await;

        let policy = &shared.config.retry;
        let rounds = policy.max_attempts.max(1);
        let mut outcome = "exhausted";
        for round in 1..=rounds {
            if round > 1 {
                tokio::time::sleep(policy.delay_for(round - 2)).await;
            }
            if self.superseded(epoch) {
                outcome = "cancelled";
                break;
            }
            match self.establish(&credentials, epoch).await {
                Ok(true) => {
                    shared
                        .metrics
                        .increment(CONNECTION_RECONNECT, &[("reason", reason), ("outcome", "success")]);
                    info!(connection = %shared.id, reason, round, "reconnected");
                    return true;
                }
                Ok(false) => {
                    debug!(connection = %shared.id, round, "reconnect round failed");
                }
                Err(e) => {
                    error!(connection = %shared.id, reason, error = %e, "reconnect aborted");
                    outcome = "aborted";
                    break;
                }
            }
        }

        self.settle_disconnected(epoch).await;
        shared
            .metrics
            .increment(CONNECTION_RECONNECT, &[("reason", reason), ("outcome", outcome)]);
        error!(connection = %shared.id, reason, outcome, "reconnect failed; link is down");
        false
    }

    /// Run `action` only if the link is connected at the moment of the check.
    ///
    /// The state lock is released before `action` runs, so slow I/O never
    /// holds it.
    pub async fn with_state_check<F, Fut, T>(
        &self,
        operation: &str,
        action: F,
    ) -> Result<T, ConnectionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        {
            let state = self.shared.state.lock().await;
            if *state != ConnectionState::Connected {
                return Err(ConnectionError::NotConnected {
                    operation: operation.to_string(),
                    state: *state,
                });
            }
        }
        action().await
    }

    /// Write one encoded frame if connected
    pub async fn send(&self, operation: &str, frame: &[u8]) -> Result<(), ConnectionError> {
        self.with_state_check(operation, || self.write_frame(frame))
            .await
    }

    pub(crate) async fn write_frame(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::Closed)?;
        tokio::time::timeout(self.shared.config.timeouts.write, async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout("socket write"))??;

        let stats = &self.shared.stats;
        stats.frames_out.fetch_add(1, Ordering::Relaxed);
        stats.bytes_out.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Next data or unknown frame queued by the router
    pub async fn next_frame(&self) -> Option<RoutedFrame> {
        self.shared.data_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryPolicy, TimeoutConfig};
    use crate::metrics::{InMemoryMetrics, CONNECTION_STATE_TRANSITION};
    use crate::test_support::{accept, read_frame, read_handshake, wait_until, ScriptedConnector};
    use bridge_wire::PacketType;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    const ENDPOINT: [u8; 4] = [0x39, 0x87, 0xC8, 0x57];

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            retry: RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            timeouts: TimeoutConfig::default(),
            data_queue_capacity: 16,
        }
    }

    fn manager(
        connector: ScriptedConnector,
    ) -> (ConnectionManager, Arc<ScriptedConnector>, Arc<InMemoryMetrics>) {
        let connector = Arc::new(connector);
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager =
            ConnectionManager::new("test", connector.clone(), test_config(), metrics.clone());
        (manager, connector, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retry_after_timeout() {
        let (connector, mut peers) = ScriptedConnector::new(2);
        let (manager, connector, metrics) = manager(connector);
        let mut second = peers.pop().unwrap();
        let mut first = peers.pop().unwrap();

        tokio::spawn(async move {
            read_handshake(&mut first).await;
            // never answer
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(first);
        });
        let peer = tokio::spawn(async move {
            accept(&mut second).await;
            second
        });

        assert!(manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());
        let _peer = peer.await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.dials(), 2);
        let delays = metrics.histogram(CONNECTION_HANDSHAKE_RETRY_DELAY_MS).unwrap();
        assert_eq!(delays.count, 1);
        assert_eq!(delays.sum, 1000.0);
        assert_eq!(
            metrics.counter_with(CONNECTION_HANDSHAKE, &[("outcome", "timeout")]),
            1
        );
        assert!(manager.pending().is_empty());

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let (connector, mut peers) = ScriptedConnector::new(3);
        let (manager, connector, _metrics) = manager(connector);
        let mut first = peers.remove(0);

        tokio::spawn(async move {
            read_handshake(&mut first).await;
            first.write_all(&[0x28, 0, 0, 0, 1, 0x05]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let err = manager.connect(ENDPOINT, &b"wrong"[..]).await.unwrap_err();
        assert!(matches!(err, ConnectionError::AuthenticationFailed(5)));
        assert_eq!(connector.dials(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_false() {
        let (connector, _peers) = ScriptedConnector::new(0);
        let (manager, connector, metrics) = manager(connector);

        assert!(!manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());
        assert_eq!(connector.dials(), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            metrics.histogram(CONNECTION_HANDSHAKE_RETRY_DELAY_MS).unwrap().count,
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_when_connected_is_noop() {
        let (connector, mut peers) = ScriptedConnector::new(1);
        let (manager, connector, _metrics) = manager(connector);
        let mut peer = peers.remove(0);
        let peer_task = tokio::spawn(async move {
            accept(&mut peer).await;
            peer
        });

        assert!(manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());
        let _peer = peer_task.await.unwrap();
        assert!(manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());
        assert_eq!(connector.dials(), 1);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnect_requires_credentials() {
        let (connector, _peers) = ScriptedConnector::new(0);
        let (manager, connector, _metrics) = manager(connector);

        let err = manager.reconnect("manual").await.unwrap_err();
        assert!(matches!(err, ConnectionError::NoCredentials));
        assert!(!err.is_retryable());
        assert_eq!(connector.dials(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_connected_state() {
        let (connector, _peers) = ScriptedConnector::new(0);
        let (manager, _connector, _metrics) = manager(connector);

        let err = manager.send("test_send", &[0xD3, 0, 0, 0, 0]).await.unwrap_err();
        match err {
            ConnectionError::NotConnected { operation, state } => {
                assert_eq!(operation, "test_send");
                assert_eq!(state, ConnectionState::Disconnected);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_connected_after_disconnect() {
        let (connector, mut peers) = ScriptedConnector::new(1);
        let (manager, _connector, metrics) = manager(connector);
        let mut peer = peers.remove(0);
        let (seen_tx, seen_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            read_handshake(&mut peer).await;
            let _ = seen_tx.send(());
            let _ = reply_rx.await;
            let _ = peer.write_all(&crate::test_support::HELLO_ACK_OK).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(ENDPOINT, &b"secret"[..]).await })
        };
        seen_rx.await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.disconnect().await;
        reply_tx.send(()).unwrap();

        assert!(!connecting.await.unwrap().unwrap());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            metrics.counter_with(
                CONNECTION_STATE_TRANSITION,
                &[("from", "connecting"), ("to", "connected")]
            ),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_senders_during_disconnect() {
        let (connector, mut peers) = ScriptedConnector::new(1);
        let (manager, _connector, _metrics) = manager(connector);
        let mut peer = peers.remove(0);
        let peer_task = tokio::spawn(async move {
            accept(&mut peer).await;
            peer
        });
        assert!(manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());
        let _peer = peer_task.await.unwrap();

        let senders: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.send("burst", &[0xD3, 0, 0, 0, 0]).await })
            })
            .collect();
        manager.disconnect().await;

        for sender in senders {
            match sender.await.unwrap() {
                Ok(()) | Err(ConnectionError::NotConnected { .. }) | Err(ConnectionError::Closed) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.send("after", &[0xD3, 0, 0, 0, 0]).await,
            Err(ConnectionError::NotConnected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_triggers_single_reconnect() {
        let (connector, mut peers) = ScriptedConnector::new(2);
        let (manager, connector, metrics) = manager(connector);
        let mut second = peers.pop().unwrap();
        let mut first = peers.pop().unwrap();

        tokio::spawn(async move {
            accept(&mut first).await;
            // Swallow the heartbeat without acknowledging it
            let heartbeat = read_frame(&mut first).await;
            assert_eq!(heartbeat.packet_type, PacketType::Heartbeat);
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let (reconnected_tx, reconnected_rx) = oneshot::channel();
        tokio::spawn(async move {
            accept(&mut second).await;
            let _ = reconnected_tx.send(());
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());
        reconnected_rx.await.unwrap();

        let m = manager.clone();
        assert!(
            wait_until(Duration::from_secs(60), move || m.state() == ConnectionState::Connected
                && m.stats().reconnects == 1)
            .await
        );
        assert_eq!(connector.dials(), 2);
        assert_eq!(
            metrics.counter_with(
                CONNECTION_RECONNECT,
                &[("reason", "heartbeat_timeout"), ("outcome", "success")]
            ),
            1
        );
        assert_eq!(metrics.counter(CONNECTION_RECONNECT), 1);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_are_coalesced() {
        let (connector, mut peers) = ScriptedConnector::new(2);
        let (manager, connector, metrics) = manager(connector);
        let mut second = peers.pop().unwrap();
        let mut first = peers.pop().unwrap();

        tokio::spawn(async move {
            accept(&mut first).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tokio::spawn(async move {
            accept(&mut second).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());

        let first_trigger = manager.trigger_reconnect("manual").unwrap();
        let second_trigger = manager.trigger_reconnect("manual").unwrap();
        assert!(first_trigger.started());
        assert!(!second_trigger.started());

        assert!(first_trigger.wait().await);
        assert!(second_trigger.wait().await);
        assert_eq!(connector.dials(), 2);
        assert_eq!(metrics.counter(CONNECTION_RECONNECT), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_settles_disconnected() {
        let (connector, mut peers) = ScriptedConnector::new(1);
        let (manager, connector, metrics) = manager(connector);
        let mut peer = peers.remove(0);
        tokio::spawn(async move {
            accept(&mut peer).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(manager.connect(ENDPOINT, &b"secret"[..]).await.unwrap());
        assert!(!manager.reconnect("manual").await.unwrap());

        // one initial dial plus three rounds of three attempts
        assert_eq!(connector.dials(), 10);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            metrics.counter_with(
                CONNECTION_RECONNECT,
                &[("reason", "manual"), ("outcome", "exhausted")]
            ),
            1
        );
    }
}
