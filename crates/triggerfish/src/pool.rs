//! Transaction connection pool
//!
//! DDL and metadata statements run on short-lived pooled connections, never on
//! the listener connection. The pool features:
//! - Semaphore-bounded size with an acquire timeout
//! - Validation on borrow
//! - Recycling after idle timeout or maximum lifetime
//! - Statistics
//!
//! A connection whose transaction was neither committed nor rolled back is
//! closed instead of being returned to the pool.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// A database connection usable for statements and transactions
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run one or more statements without parameters
    async fn batch_execute(&self, sql: &str) -> Result<()>;

    /// Run a parameterized statement; parameters are text or NULL
    async fn execute(&self, sql: &str, params: &[Option<&str>]) -> Result<u64>;

    /// Whether the connection is still usable
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Opens connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections (idle and in use)
    pub size: usize,
    /// Idle connections
    pub idle: usize,
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of successful acquisitions
    pub acquisitions: u64,
    /// Number of acquire timeouts
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Connections discarded by validation
    pub health_check_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// LIFO so the most recently used connection is reused first
    idle: Mutex<Vec<PoolEntry>>,
    semaphore: Arc<Semaphore>,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime()
            || entry.last_used.elapsed() > self.config.idle_timeout()
    }

    fn discard(&self) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
    }
}

/// Bounded pool of transaction connections
#[derive(Clone)]
pub struct TransactionPool {
    inner: Arc<PoolInner>,
}

impl TransactionPool {
    /// Create an empty pool; connections are opened on demand
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                idle: Mutex::new(Vec::with_capacity(config.max_size)),
                config,
                factory,
                total_connections: AtomicUsize::new(0),
                stats: AtomicPoolStats::default(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection, waiting up to the acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::disposed("transaction pool"));
        }

        let start = Instant::now();
        let permit = tokio::time::timeout(
            inner.config.acquire_timeout(),
            inner.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            inner.stats.record_exhausted();
            Error::timeout(format!(
                "no pooled connection available within {}ms",
                inner.config.acquire_timeout_ms
            ))
        })?
        .map_err(|_| Error::disposed("transaction pool"))?;

        let reused = loop {
            let Some(entry) = inner.idle.lock().pop() else {
                break None;
            };
            if inner.should_recycle(&entry) {
                debug!("Recycling expired pooled connection");
                let _ = entry.conn.close().await;
                inner.discard();
                continue;
            }
            if inner.config.test_on_borrow && !entry.conn.is_valid().await {
                warn!("Discarding pooled connection that failed validation");
                inner.discard();
                inner.stats.record_health_check_failure();
                continue;
            }
            break Some(entry);
        };

        let entry = match reused {
            Some(entry) => entry,
            None => {
                let conn = inner.factory.connect().await?;
                inner.total_connections.fetch_add(1, Ordering::AcqRel);
                inner.stats.record_created();
                let now = Instant::now();
                PoolEntry {
                    conn,
                    created_at: now,
                    last_used: now,
                }
            }
        };

        inner
            .stats
            .record_acquisition(start.elapsed().as_millis() as u64);

        Ok(PooledConnection {
            entry: Some(entry),
            pool: self.inner.clone(),
            broken: false,
            _permit: permit,
        })
    }

    /// Borrow a connection and open a transaction on it
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.acquire().await?).await
    }

    /// Current statistics
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let s = &inner.stats;
        PoolStats {
            size: inner.total_connections.load(Ordering::Acquire),
            idle: inner.idle.lock().len(),
            connections_created: s.connections_created.load(Ordering::Relaxed),
            connections_closed: s.connections_closed.load(Ordering::Relaxed),
            acquisitions: s.acquisitions.load(Ordering::Relaxed),
            exhausted_count: s.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: s.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: s.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop handing out connections and close idle ones.
    ///
    /// Connections still borrowed are closed when returned. Returns the
    /// close failures, which never stop the remaining connections from
    /// being closed.
    pub async fn close(&self) -> Vec<Error> {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        inner.semaphore.close();

        let drained: Vec<PoolEntry> = inner.idle.lock().drain(..).collect();
        let mut failures = Vec::new();
        for entry in drained {
            if let Err(e) = entry.conn.close().await {
                failures.push(e);
            }
            inner.discard();
        }
        failures
    }
}

/// A connection borrowed from a [`TransactionPool`]
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    pool: Arc<PoolInner>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Close the connection instead of returning it to the pool
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match &self.entry {
            Some(entry) => entry.conn.as_ref(),
            // entry is only taken in drop
            None => unreachable!("pooled connection used after return"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        if self.broken || self.pool.shutdown.load(Ordering::Acquire) {
            self.pool.discard();
            return;
        }
        entry.last_used = Instant::now();
        self.pool.idle.lock().push(entry);
    }
}

/// An open transaction on a pooled connection.
///
/// Dropping it without [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) closes the underlying connection.
pub struct Transaction {
    conn: PooledConnection,
    finished: bool,
}

impl Transaction {
    /// Issue `BEGIN` on `conn`
    pub async fn begin(mut conn: PooledConnection) -> Result<Self> {
        if let Err(e) = conn.batch_execute("BEGIN").await {
            conn.discard();
            return Err(Error::Transaction {
                message: "failed to begin transaction".to_string(),
                source: Some(Box::new(e)),
            });
        }
        Ok(Self {
            conn,
            finished: false,
        })
    }

    /// Run statements inside the transaction
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.conn.batch_execute(sql).await
    }

    /// Run a parameterized statement inside the transaction
    pub async fn execute(&self, sql: &str, params: &[Option<&str>]) -> Result<u64> {
        self.conn.execute(sql, params).await
    }

    /// Commit
    pub async fn commit(mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    /// Roll back
    pub async fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, statement: &'static str) -> Result<()> {
        self.conn
            .batch_execute(statement)
            .await
            .map_err(|e| Error::Transaction {
                message: format!("{} failed", statement),
                source: Some(Box::new(e)),
            })?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.discard();
        }
    }
}
