//! In-memory backends for testing
//!
//! [`MemoryBroker`] stands in for the database's LISTEN/NOTIFY machinery and
//! [`MemoryConnectionFactory`] for the transaction connections, so the full
//! runtime can be driven without a server.
//!
//! # Example
//!
//! ```rust,ignore
//! use triggerfish::testing::*;
//!
//! let broker = MemoryBroker::new();
//! let factory = MemoryConnectionFactory::new();
//! let manager = ConnectionManager::from_config(
//!     &TriggerfishConfig::default(),
//!     Arc::new(broker.connector()),
//!     Arc::new(factory.clone()),
//! );
//!
//! broker.publish("orders", r#"{"operation":"INSERT",...}"#);
//! assert!(factory.statements().is_empty());
//! ```

use crate::error::{Error, Result};
use crate::pool::{Connection, ConnectionFactory};
use crate::transport::{
    EventSender, ListenerConnector, ListenerTransport, RawNotification, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Memory Broker
// ============================================================================

struct BrokerConnection {
    id: usize,
    events: EventSender,
    channels: HashSet<String>,
    open: bool,
}

#[derive(Default)]
struct BrokerState {
    connections: Vec<BrokerConnection>,
    next_id: usize,
    fail_connects: usize,
    fail_listen: HashSet<String>,
    fail_unlisten: HashSet<String>,
    connects: usize,
    listens: usize,
}

/// In-memory LISTEN/NOTIFY broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening listener connections on this broker
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Deliver `payload` to every open connection listening on `channel`.
    ///
    /// Returns the number of connections it was delivered to.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for conn in state.connections.iter().filter(|c| c.open) {
            if conn.channels.contains(channel) {
                let raw = RawNotification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                    process_id: conn.id as i32,
                };
                if conn.events.send(TransportEvent::Notification(raw)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Drop every open connection as if the server went away
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.state.lock();
        for conn in state.connections.iter_mut().filter(|c| c.open) {
            conn.open = false;
            conn.channels.clear();
            let _ = conn.events.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    /// Fail every LISTEN on `channel`
    pub fn fail_listen(&self, channel: &str) {
        self.state.lock().fail_listen.insert(channel.to_string());
    }

    /// Fail every UNLISTEN on `channel`
    pub fn fail_unlisten(&self, channel: &str) {
        self.state.lock().fail_unlisten.insert(channel.to_string());
    }

    /// Channels listened on by any open connection
    pub fn listening_channels(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .connections
            .iter()
            .filter(|c| c.open)
            .flat_map(|c| c.channels.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Open connections
    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.iter().filter(|c| c.open).count()
    }

    /// Successful connection attempts
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Successful LISTEN round-trips
    pub fn listen_count(&self) -> usize {
        self.state.lock().listens
    }
}

/// [`ListenerConnector`] over a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl ListenerConnector for MemoryConnector {
    async fn connect(&self, events: EventSender) -> Result<Box<dyn ListenerTransport>> {
        let mut state = self.broker.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::transport("connection refused"));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.connects += 1;
        state.connections.push(BrokerConnection {
            id,
            events,
            channels: HashSet::new(),
            open: true,
        });
        Ok(Box::new(MemoryListener {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct MemoryListener {
    broker: MemoryBroker,
    id: usize,
}

impl MemoryListener {
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut BrokerConnection) -> T,
    ) -> Result<T> {
        let mut state = self.broker.state.lock();
        state
            .connections
            .iter_mut()
            .find(|c| c.id == self.id && c.open)
            .map(f)
            .ok_or_else(|| Error::transport("connection closed"))
    }
}

#[async_trait]
impl ListenerTransport for MemoryListener {
    async fn listen(&self, channel: &str) -> Result<()> {
        if self.broker.state.lock().fail_listen.contains(channel) {
            return Err(Error::transport(format!("LISTEN {} failed", channel)));
        }
        self.with_connection(|c| c.channels.insert(channel.to_string()))?;
        self.broker.state.lock().listens += 1;
        Ok(())
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        if self.broker.state.lock().fail_unlisten.contains(channel) {
            return Err(Error::transport(format!("UNLISTEN {} failed", channel)));
        }
        self.with_connection(|c| c.channels.remove(channel))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock();
        if let Some(conn) = state.connections.iter_mut().find(|c| c.id == self.id) {
            conn.open = false;
            conn.channels.clear();
        }
        Ok(())
    }
}

// ============================================================================
// Memory Connection Factory
// ============================================================================

#[derive(Default)]
struct FactoryState {
    statements: Mutex<Vec<String>>,
    fail_patterns: Mutex<Vec<String>>,
    fail_connects: AtomicUsize,
    connections: AtomicUsize,
}

/// Connection factory recording every statement it is asked to run
#[derive(Clone, Default)]
pub struct MemoryConnectionFactory {
    state: Arc<FactoryState>,
}

impl MemoryConnectionFactory {
    /// Create a factory with an empty statement log
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement run so far, in order, including failed ones
    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }

    /// Forget the recorded statements
    pub fn clear_statements(&self) {
        self.state.statements.lock().clear();
    }

    /// Fail every statement containing `pattern`
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.state.fail_patterns.lock().push(pattern.into());
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Connections opened so far
    pub fn connections_opened(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let refused = self
            .state
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::transport("connection refused"));
        }
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    state: Arc<FactoryState>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn run(&self, sql: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::transport("connection closed"));
        }
        self.state.statements.lock().push(sql.to_string());
        let rejected = self
            .state
            .fail_patterns
            .lock()
            .iter()
            .any(|p| sql.contains(p.as_str()));
        if rejected {
            return Err(Error::query_with_sql("statement rejected", sql));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.run(sql)
    }

    async fn execute(&self, sql: &str, _params: &[Option<&str>]) -> Result<u64> {
        self.run(sql).map(|()| 1)
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_reaches_listening_connections_only() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = broker.connector().connect(tx).await.unwrap();
        listener.listen("orders").await.unwrap();

        assert_eq!(broker.publish("orders", "{}"), 1);
        assert_eq!(broker.publish("users", "{}"), 0);
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Notification(raw)) if raw.channel == "orders"
        ));
    }

    #[tokio::test]
    async fn test_close_does_not_report_disconnect() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = broker.connector().connect(tx).await.unwrap();
        listener.listen("orders").await.unwrap();
        listener.close().await.unwrap();

        broker.disconnect_all("gone");
        assert!(rx.try_recv().is_err());
        assert!(broker.listening_channels().is_empty());
        assert!(listener.listen("orders").await.is_err());
    }

    #[tokio::test]
    async fn test_statement_failure_injection() {
        let factory = MemoryConnectionFactory::new();
        factory.fail_statements_containing("DROP");
        let conn = factory.connect().await.unwrap();

        assert!(conn.batch_execute("CREATE TABLE t ()").await.is_ok());
        assert!(conn.batch_execute("DROP TABLE t").await.is_err());
        assert_eq!(
            factory.statements(),
            vec!["CREATE TABLE t ()", "DROP TABLE t"]
        );
    }
}
