//! Connection pool for storage partitions
//!
//! Files live on the partition ("datacenter") that stores them, and every
//! partition other than the home one needs the session's authorization
//! exported to it before a connection can be opened. Opening connections is
//! expensive, so they are pooled per partition and reused across downloads.
//!
//! Each partition has a fixed number of slots (a FIFO-fair semaphore). A
//! lease holds a slot for its whole lifetime and hands the connection back
//! to the idle list when dropped. A reaper task closes connections that sat
//! idle for longer than the idle timeout.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::telegram::{ExportedAuthorization, PartitionConnection, PartitionId, ProtocolClient};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest interval between two reaper passes
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum live connections per partition
    pub max_connections_per_partition: usize,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        PoolSettings {
            max_connections_per_partition: config.connections_per_partition,
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Snapshot of one partition's connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    pub partition: PartitionId,
    /// Open connections, idle or leased
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
}

struct IdleConnection {
    conn: Arc<dyn PartitionConnection>,
    last_used: Instant,
}

#[derive(Default)]
struct PartitionState {
    idle: Vec<IdleConnection>,
    live: usize,
}

/// Per-partition slots, idle list and authorization cache
struct PartitionPool {
    id: PartitionId,
    slots: Arc<Semaphore>,
    state: Mutex<PartitionState>,
    authorization: tokio::sync::Mutex<Option<ExportedAuthorization>>,
    closed: CancellationToken,
}

impl PartitionPool {
    fn new(id: PartitionId, max_connections: usize, closed: CancellationToken) -> Self {
        PartitionPool {
            id,
            slots: Arc::new(Semaphore::new(max_connections)),
            state: Mutex::new(PartitionState::default()),
            authorization: tokio::sync::Mutex::new(None),
            closed,
        }
    }

    fn take_idle(&self) -> Option<Arc<dyn PartitionConnection>> {
        self.state.lock().idle.pop().map(|idle| idle.conn)
    }

    fn release(&self, conn: Arc<dyn PartitionConnection>, broken: bool) {
        {
            let mut state = self.state.lock();
            if !broken && !self.closed.is_cancelled() {
                state.idle.push(IdleConnection {
                    conn,
                    last_used: Instant::now(),
                });
                return;
            }
            state.live -= 1;
        }

        debug!("Closing connection to partition {} (broken={})", self.id, broken);
        conn.close();
    }

    fn evict(&self, idle_timeout: Option<Duration>) -> usize {
        let expired: Vec<IdleConnection> = {
            let mut state = self.state.lock();
            let (expired, kept): (Vec<_>, Vec<_>) =
                state.idle.drain(..).partition(|idle| match idle_timeout {
                    Some(timeout) => idle.last_used.elapsed() >= timeout,
                    None => true,
                });
            state.idle = kept;
            state.live -= expired.len();
            expired
        };

        for idle in &expired {
            idle.conn.close();
        }
        expired.len()
    }

    fn stats(&self) -> PartitionStats {
        let state = self.state.lock();
        PartitionStats {
            partition: self.id,
            live: state.live,
            idle: state.idle.len(),
            leased: state.live - state.idle.len(),
        }
    }
}

/// Counts a connection being opened; undone unless the open succeeds
struct LiveReservation<'a> {
    partition: &'a PartitionPool,
    armed: bool,
}

impl<'a> LiveReservation<'a> {
    fn new(partition: &'a PartitionPool) -> Self {
        partition.state.lock().live += 1;
        LiveReservation {
            partition,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for LiveReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.partition.state.lock().live -= 1;
        }
    }
}

/// Leased connection; returns to the pool when dropped
pub struct PooledConnection {
    conn: Arc<dyn PartitionConnection>,
    pool: Arc<PartitionPool>,
    broken: bool,
    // Released after the connection is back on the idle list
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Partition the connection is authorized for
    pub fn partition(&self) -> PartitionId {
        self.pool.id
    }

    /// Shared handle for issuing requests on this connection
    pub fn handle(&self) -> Arc<dyn PartitionConnection> {
        self.conn.clone()
    }

    /// Close the connection on release instead of reusing it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("partition", &self.pool.id)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.conn.clone(), self.broken);
    }
}

/// Process-wide pool of partition connections
pub struct ConnectionPool {
    client: Arc<dyn ProtocolClient>,
    settings: PoolSettings,
    partitions: Mutex<HashMap<PartitionId, Arc<PartitionPool>>>,
    closed: CancellationToken,
}

impl ConnectionPool {
    /// Create the pool and start its idle reaper
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(client: Arc<dyn ProtocolClient>, settings: PoolSettings) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool {
            client,
            settings,
            partitions: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });

        let interval = (pool.settings.idle_timeout / 2).max(MIN_REAP_INTERVAL);
        tokio::spawn(reap_idle(
            Arc::downgrade(&pool),
            pool.closed.clone(),
            interval,
        ));

        info!(
            "Connection pool ready ({} connections per partition, idle timeout {:?})",
            pool.settings.max_connections_per_partition, pool.settings.idle_timeout
        );
        pool
    }

    /// Lease a connection, waiting for a free slot if needed
    ///
    /// Waiters are served in arrival order. Stops waiting with
    /// `Error::Cancelled` when `cancel` fires.
    pub async fn acquire(
        &self,
        partition: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        let part = self.partition(partition)?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.closed.cancelled() => return Err(Error::PoolClosed),
            permit = part.slots.clone().acquire_owned() => {
                permit.map_err(|_| Error::PoolClosed)?
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            conn = self.checkout(part.clone(), permit) => conn,
        }
    }

    /// Lease a connection only if a slot is free right now
    pub async fn try_acquire(&self, partition: PartitionId) -> Result<Option<PooledConnection>> {
        let part = self.partition(partition)?;

        let permit = match part.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Ok(None),
        };

        self.checkout(part, permit).await.map(Some)
    }

    /// Return a connection to the pool
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close connections idle for longer than the idle timeout
    pub fn evict_idle(&self) -> usize {
        self.partition_list()
            .iter()
            .map(|part| part.evict(Some(self.settings.idle_timeout)))
            .sum()
    }

    /// Close every idle connection and refuse further leases
    ///
    /// Leased connections are closed when they are released.
    pub fn teardown(&self) {
        self.closed.cancel();

        let closed: usize = self
            .partition_list()
            .iter()
            .map(|part| part.evict(None))
            .sum();

        info!("Connection pool closed ({} idle connections dropped)", closed);
    }

    /// Whether `teardown` has run
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Per-partition connection counts, ordered by partition
    pub fn stats(&self) -> Vec<PartitionStats> {
        let mut stats: Vec<PartitionStats> =
            self.partition_list().iter().map(|part| part.stats()).collect();
        stats.sort_by_key(|s| s.partition);
        stats
    }

    fn partition(&self, partition: PartitionId) -> Result<Arc<PartitionPool>> {
        if self.closed.is_cancelled() {
            return Err(Error::PoolClosed);
        }

        let mut partitions = self.partitions.lock();
        let part = partitions.entry(partition).or_insert_with(|| {
            Arc::new(PartitionPool::new(
                partition,
                self.settings.max_connections_per_partition,
                self.closed.clone(),
            ))
        });
        Ok(part.clone())
    }

    fn partition_list(&self) -> Vec<Arc<PartitionPool>> {
        self.partitions.lock().values().cloned().collect()
    }

    async fn checkout(
        &self,
        part: Arc<PartitionPool>,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledConnection> {
        let conn = match part.take_idle() {
            Some(conn) => conn,
            None => {
                let reservation = LiveReservation::new(&part);
                let conn = self.open(&part).await?;
                reservation.commit();
                conn
            }
        };

        Ok(PooledConnection {
            conn,
            pool: part,
            broken: false,
            _permit: permit,
        })
    }

    async fn open(&self, part: &PartitionPool) -> Result<Arc<dyn PartitionConnection>> {
        let authorization = self.authorization(part).await?;
        let conn = self.client.connect(part.id, authorization).await.map_err(|e| {
            warn!("Failed to connect to partition {}: {}", part.id, e);
            Error::Upstream(e)
        })?;

        debug!("Opened connection to partition {}", part.id);
        Ok(conn)
    }

    async fn authorization(&self, part: &PartitionPool) -> Result<Option<ExportedAuthorization>> {
        if part.id == self.client.home_partition() {
            return Ok(None);
        }

        let mut cached = part.authorization.lock().await;
        if let Some(auth) = cached.as_ref() {
            return Ok(Some(auth.clone()));
        }

        let auth = self.client.export_authorization(part.id).await?;
        info!("Exported authorization to partition {}", part.id);
        *cached = Some(auth.clone());
        Ok(Some(auth))
    }
}

async fn reap_idle(pool: Weak<ConnectionPool>, closed: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else { break };
        let evicted = pool.evict_idle();
        if evicted > 0 {
            debug!("Closed {} idle connections", evicted);
        }
    }
}
