//! Connection lifecycle manager
//!
//! Owns the single long-lived listener connection and the transaction pool.
//! Only the manager issues LISTEN/UNLISTEN; each channel has exactly one raw
//! handler (the multiplexer installs its dispatcher there).
//!
//! # Reconnection
//!
//! When the listener connection drops, the manager reconnects with
//! exponential backoff and re-LISTENs every registered channel. LISTEN/NOTIFY
//! is at-most-once and not durable: notifications published while the
//! listener is down are lost and are not replayed.

use crate::config::{ReconnectPolicy, TriggerfishConfig};
use crate::error::{Error, Result};
use crate::pool::{ConnectionFactory, Transaction, TransactionPool};
use crate::transport::{
    EventSender, ListenerConnector, ListenerTransport, RawNotification, TransportEvent,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use triggerfish_sql::security::validate_channel;

/// Handler receiving every raw notification on one channel
pub type RawHandler = Arc<dyn Fn(RawNotification) + Send + Sync>;

/// Listener connection events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First listener connection established
    Connected,
    /// Listener connection lost
    Disconnected {
        /// Reason reported by the transport
        reason: String,
    },
    /// Listener connection re-established and channels re-subscribed
    Reconnected {
        /// Attempts it took
        attempts: u32,
        /// Channels restored
        channels: usize,
    },
    /// Reconnect attempts exhausted; the next subscribe reconnects
    ReconnectFailed {
        /// Attempts made
        attempts: u32,
    },
    /// Manager disposed
    Disposed,
}

/// A failure collected during teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// What was being torn down (channel, trigger key, component)
    pub target: String,
    /// Error message
    pub error: String,
}

/// Outcome of a teardown that never stops at the first failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Number of teardown steps attempted
    pub attempted: usize,
    /// Steps that failed
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Whether every step succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Record the outcome of one step
    pub fn record(&mut self, target: impl Into<String>, result: Result<()>) {
        self.attempted += 1;
        if let Err(e) = result {
            self.failures.push(TeardownFailure {
                target: target.into(),
                error: e.to_string(),
            });
        }
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: TeardownReport) {
        self.attempted += other.attempted;
        self.failures.extend(other.failures);
    }
}

#[derive(Default)]
struct ListenerSlot {
    transport: Option<Box<dyn ListenerTransport>>,
    ever_connected: bool,
}

struct ManagerInner {
    connector: Arc<dyn ListenerConnector>,
    pool: TransactionPool,
    policy: ReconnectPolicy,
    /// Serializes every LISTEN/UNLISTEN and (re)connect
    listener: Mutex<ListenerSlot>,
    handlers: RwLock<HashMap<String, RawHandler>>,
    event_tx: EventSender,
    event_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
    disposed: AtomicBool,
}

/// Manages the listener connection and the transaction pool
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager; the listener connects lazily on first subscribe
    pub fn new(
        connector: Arc<dyn ListenerConnector>,
        pool: TransactionPool,
        policy: ReconnectPolicy,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                pool,
                policy,
                listener: Mutex::new(ListenerSlot::default()),
                handlers: RwLock::new(HashMap::new()),
                event_tx,
                event_rx: parking_lot::Mutex::new(Some(event_rx)),
                event_loop: parking_lot::Mutex::new(None),
                events,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a manager from configuration and explicit backends
    pub fn from_config(
        config: &TriggerfishConfig,
        connector: Arc<dyn ListenerConnector>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let pool = TransactionPool::new(config.pool.clone(), factory);
        Self::new(connector, pool, config.listener.reconnect.clone())
    }

    /// Create a PostgreSQL-backed manager
    #[cfg(feature = "postgres")]
    pub fn connect_postgres(config: &TriggerfishConfig) -> Result<Self> {
        use crate::postgres::{PgConnectionFactory, PgListenerConnector};

        let connector = PgListenerConnector::new(&config.database, &config.listener)?;
        let factory = PgConnectionFactory::new(&config.database)?;
        Ok(Self::from_config(
            config,
            Arc::new(connector),
            Arc::new(factory),
        ))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("connection manager"));
        }
        Ok(())
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Listener connection events
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Transaction pool
    pub fn pool(&self) -> &TransactionPool {
        &self.inner.pool
    }

    /// Channels with a registered handler
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.inner.handlers.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Whether the listener connection is currently open
    pub async fn is_connected(&self) -> bool {
        self.inner.listener.lock().await.transport.is_some()
    }

    /// Register the handler for `channel`, issuing LISTEN the first time.
    ///
    /// Returns once the server confirmed the subscription. Registering a
    /// channel that is already subscribed replaces its handler without a
    /// round-trip.
    pub async fn subscribe(&self, channel: &str, handler: RawHandler) -> Result<()> {
        self.ensure_active()?;
        validate_channel(channel)?;

        let mut slot = self.inner.listener.lock().await;
        self.ensure_active()?;

        if self.inner.handlers.read().contains_key(channel) {
            self.inner
                .handlers
                .write()
                .insert(channel.to_string(), handler);
            return Ok(());
        }

        if slot.transport.is_none() {
            self.connect_listener(&mut slot).await?;
        }
        let transport = slot
            .transport
            .as_ref()
            .ok_or_else(|| Error::transport("listener connection unavailable"))?;
        transport.listen(channel).await?;

        self.inner
            .handlers
            .write()
            .insert(channel.to_string(), handler);
        debug!("LISTEN {}", channel);
        Ok(())
    }

    /// Remove the handler for `channel` and issue UNLISTEN.
    ///
    /// A channel without a handler is a no-op.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.ensure_active()?;

        let slot = self.inner.listener.lock().await;
        if self.inner.handlers.write().remove(channel).is_none() {
            return Ok(());
        }
        match slot.transport.as_ref() {
            Some(transport) => {
                transport.unlisten(channel).await?;
                debug!("UNLISTEN {}", channel);
                Ok(())
            }
            // connection is down; the channel is not re-LISTENed on reconnect
            None => Ok(()),
        }
    }

    /// Run `f` inside a transaction on a pooled connection.
    ///
    /// Commits when `f` succeeds and rolls back when it fails.
    ///
    /// ```rust,ignore
    /// manager
    ///     .run_in_transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.batch_execute("SELECT 1").await?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, Result<T>> + Send,
    {
        self.ensure_active()?;
        let tx = self.inner.pool.begin().await?;
        match f(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback failed after error '{}': {}", e, rollback);
                }
                Err(e)
            }
        }
    }

    /// Run a single statement in its own transaction
    pub async fn execute(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.run_in_transaction(move |tx| Box::pin(async move { tx.batch_execute(&sql).await }))
            .await
    }

    /// Unsubscribe every channel and close both connections.
    ///
    /// Idempotent. Failures are collected, never short-circuited; afterwards
    /// every other method fails with [`Error::Disposed`].
    pub async fn dispose(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return report;
        }

        let mut slot = self.inner.listener.lock().await;
        let channels: Vec<String> = self.inner.handlers.write().drain().map(|(c, _)| c).collect();

        if let Some(transport) = slot.transport.take() {
            for channel in &channels {
                report.record(channel.clone(), transport.unlisten(channel).await);
            }
            report.record("listener connection", transport.close().await);
        }
        drop(slot);

        if let Some(handle) = self.inner.event_loop.lock().take() {
            handle.abort();
        }

        for failure in self.inner.pool.close().await {
            report.record("transaction pool", Err(failure));
        }

        let _ = self.inner.events.send(ConnectionEvent::Disposed);
        info!(
            "Connection manager disposed ({} channels, {} failures)",
            channels.len(),
            report.failures.len()
        );
        report
    }

    /// Open the listener and re-LISTEN every registered channel
    async fn connect_listener(&self, slot: &mut ListenerSlot) -> Result<()> {
        self.start_event_loop();

        let transport = self
            .inner
            .connector
            .connect(self.inner.event_tx.clone())
            .await?;

        let channels: Vec<String> = self.inner.handlers.read().keys().cloned().collect();
        for channel in &channels {
            if let Err(e) = transport.listen(channel).await {
                let _ = transport.close().await;
                return Err(e);
            }
        }

        slot.transport = Some(transport);
        if !slot.ever_connected {
            slot.ever_connected = true;
            let _ = self.inner.events.send(ConnectionEvent::Connected);
        }
        Ok(())
    }

    fn start_event_loop(&self) {
        let Some(rx) = self.inner.event_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(run_event_loop(weak, rx));
        *self.inner.event_loop.lock() = Some(handle);
    }

    async fn reconnect(&self) {
        let policy = self.inner.policy.clone();
        let mut attempt: u32 = 0;

        while policy.should_retry(attempt) {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            attempt += 1;

            let mut slot = self.inner.listener.lock().await;
            if self.is_disposed() {
                return;
            }
            if slot.transport.is_some() {
                // a subscribe reconnected in the meantime
                return;
            }

            match self.connect_listener(&mut slot).await {
                Ok(()) => {
                    let channels = self.inner.handlers.read().len();
                    warn!(
                        "Listener reconnected after {} attempt(s), {} channel(s) restored; \
                         notifications published while disconnected were lost",
                        attempt, channels
                    );
                    let _ = self.inner.events.send(ConnectionEvent::Reconnected {
                        attempts: attempt,
                        channels,
                    });
                    return;
                }
                Err(e) => {
                    warn!("Listener reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }

        error!(
            "Listener reconnect gave up after {} attempt(s); channels stay registered \
             and are restored on the next subscribe",
            attempt
        );
        let _ = self
            .inner
            .events
            .send(ConnectionEvent::ReconnectFailed { attempts: attempt });
    }
}

async fn run_event_loop(weak: Weak<ManagerInner>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let manager = ConnectionManager { inner };

        match event {
            TransportEvent::Notification(raw) => {
                let handler = manager.inner.handlers.read().get(&raw.channel).cloned();
                match handler {
                    Some(handler) => handler(raw),
                    None => debug!("Dropping notification on unsubscribed channel {}", raw.channel),
                }
            }
            TransportEvent::Disconnected { reason } => {
                if manager.is_disposed() {
                    break;
                }
                warn!(
                    "Listener disconnected: {}; notifications until reconnect are lost",
                    reason
                );
                if let Some(transport) = manager.inner.listener.lock().await.transport.take() {
                    let _ = transport.close().await;
                }
                let _ = manager
                    .inner
                    .events
                    .send(ConnectionEvent::Disconnected { reason });
                manager.reconnect().await;
            }
        }
    }
    debug!("Listener event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_report() {
        let mut report = TeardownReport::default();
        report.record("a", Ok(()));
        report.record("b", Err(Error::transport("boom")));
        assert_eq!(report.attempted, 2);
        assert!(!report.is_clean());
        assert_eq!(report.failures[0].target, "b");

        let mut total = TeardownReport::default();
        total.merge(report);
        assert_eq!(total.attempted, 2);
        assert_eq!(total.failures.len(), 1);
    }
}
