//! Connection pools with a global connection ceiling.
//!
//! Every tenant gets its own [`ConnectionPool`], sized by its configuration.
//! Pools whose configurations share a base name also share a
//! [`ConnectionLimiter`], which caps the physical connections open across all
//! of them: per-tenant pool sizes stay safe however many tenants are active.
//!
//! Checkout order:
//!
//! 1. Reuse an idle connection.
//! 2. Reserve a slot (local `open + pending < size`, not blocked, and the
//!    limiter admits one more) under the pool lock, then connect with the lock
//!    released. The reservation is a drop guard, so a failed or cancelled
//!    connect gives the slot back.
//! 3. If the global ceiling is the blocker, close an idle connection of a
//!    sibling pool sharing the limiter and retry.
//! 4. Otherwise wait for a checkin, reclaim or close, up to the checkout
//!    timeout, then fail with [`TenantError::PoolExhausted`].
//!
//! On checkin a connection is closed instead of idled when the pool is closed
//! or another pool is waiting on the ceiling, which hands the slot over.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use crate::config::{DbConfig, TenancyConfig};
use crate::context::TenantId;
use crate::descriptor::ConnectionDescriptor;
use crate::error::{BoxError, TenantError, TenantResult};
use crate::manager::PoolConfig;

/// Opens physical connections for a resolved configuration.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The physical connection type.
    type Connection: Send + 'static;

    /// Open a connection.
    async fn connect(&self, config: &DbConfig) -> Result<Self::Connection, BoxError>;

    /// Check whether a connection can still be used.
    fn is_valid(&self, _connection: &Self::Connection) -> bool {
        true
    }
}

// ============================================================================
// Global ceiling
// ============================================================================

pub(crate) trait IdleReclaim: Send + Sync {
    fn pool_id(&self) -> u64;
    fn reclaim_idle(&self) -> bool;
}

/// Global open-connection counter for one base configuration name.
pub struct ConnectionLimiter {
    name: String,
    max: usize,
    open: AtomicUsize,
    waiting: AtomicUsize,
    notify: Notify,
    members: Mutex<Vec<Weak<dyn IdleReclaim>>>,
}

impl ConnectionLimiter {
    /// Create a limiter allowing `max` open connections.
    pub fn new(name: impl Into<String>, max: usize) -> Self {
        Self {
            name: name.into(),
            max,
            open: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            notify: Notify::new(),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Create a limiter without a ceiling.
    pub fn unlimited(name: impl Into<String>) -> Self {
        Self::new(name, usize::MAX)
    }

    /// Base configuration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ceiling.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Connections currently open or being opened.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Checkouts currently blocked by the ceiling.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn try_reserve(&self) -> bool {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max).then_some(open + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn register(&self, pool: Weak<dyn IdleReclaim>) {
        let mut members = self.members.lock();
        members.retain(|member| member.strong_count() > 0);
        members.push(pool);
    }

    /// Close one idle connection held by any pool other than `pool_id`.
    fn reclaim_idle_except(&self, pool_id: u64) -> bool {
        let members: Vec<Arc<dyn IdleReclaim>> =
            self.members.lock().iter().filter_map(Weak::upgrade).collect();
        members
            .iter()
            .filter(|member| member.pool_id() != pool_id)
            .any(|member| member.reclaim_idle())
    }
}

impl fmt::Debug for ConnectionLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLimiter")
            .field("name", &self.name)
            .field("max", &self.max)
            .field("open", &self.open())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Limiters by base configuration name.
///
/// Names without a configured ceiling get an unlimited limiter, which still
/// counts open connections.
#[derive(Debug, Default)]
pub struct ConnectionLimits {
    ceilings: std::collections::HashMap<String, usize>,
    limiters: DashMap<String, Arc<ConnectionLimiter>>,
}

impl ConnectionLimits {
    /// Create limits without ceilings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the ceilings from a tenancy configuration.
    pub fn from_config(config: &TenancyConfig) -> Self {
        Self {
            ceilings: config.max_connections.clone(),
            limiters: DashMap::new(),
        }
    }

    /// Set a ceiling.
    pub fn with_ceiling(mut self, name: impl Into<String>, max: usize) -> Self {
        self.ceilings.insert(name.into(), max);
        self
    }

    /// Get or create the limiter for a base configuration name.
    pub fn limiter(&self, name: &str) -> Arc<ConnectionLimiter> {
        if let Some(limiter) = self.limiters.get(name) {
            return limiter.value().clone();
        }
        self.limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                let max = self.ceilings.get(name).copied().unwrap_or(usize::MAX);
                Arc::new(ConnectionLimiter::new(name, max))
            })
            .value()
            .clone()
    }

    /// Get an existing limiter.
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionLimiter>> {
        self.limiters.get(name).map(|limiter| limiter.value().clone())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Checkouts served.
    pub connections_acquired: u64,
    /// Checkins.
    pub connections_released: u64,
    /// Physical connections opened.
    pub connections_opened: u64,
    /// Physical connections closed.
    pub connections_closed: u64,
    /// Checkouts that timed out.
    pub timeouts: u64,
    /// Total wait time across checkouts.
    pub total_wait_time_ms: u64,
    /// Longest single wait.
    pub max_wait_time_ms: u64,
    /// When the pool was created.
    pub created_at: Instant,
    /// Last checkout or checkin.
    pub last_activity: Option<Instant>,
}

impl PoolStats {
    /// Average wait per checkout.
    pub fn avg_wait_time(&self) -> Duration {
        if self.connections_acquired == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_wait_time_ms / self.connections_acquired)
    }
}

struct AtomicPoolStats {
    connections_acquired: AtomicU64,
    connections_released: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    timeouts: AtomicU64,
    total_wait_time_ms: AtomicU64,
    max_wait_time_ms: AtomicU64,
    created_at: Instant,
    last_activity: Mutex<Option<Instant>>,
}

impl AtomicPoolStats {
    fn new() -> Self {
        Self {
            connections_acquired: AtomicU64::new(0),
            connections_released: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            total_wait_time_ms: AtomicU64::new(0),
            max_wait_time_ms: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(None),
        }
    }

    fn record_acquire(&self, wait_time: Duration) {
        self.connections_acquired.fetch_add(1, Ordering::Relaxed);

        let wait_ms = wait_time.as_millis() as u64;
        self.total_wait_time_ms.fetch_add(wait_ms, Ordering::Relaxed);
        self.max_wait_time_ms.fetch_max(wait_ms, Ordering::Relaxed);

        *self.last_activity.lock() = Some(Instant::now());
    }

    fn record_release(&self) {
        self.connections_released.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Some(Instant::now());
    }

    fn record_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self, count: usize) {
        self.connections_closed.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_acquired: self.connections_acquired.load(Ordering::Relaxed),
            connections_released: self.connections_released.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            max_wait_time_ms: self.max_wait_time_ms.load(Ordering::Relaxed),
            created_at: self.created_at,
            last_activity: *self.last_activity.lock(),
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Local size limit.
    pub size: usize,
    /// Physical connections owned by the pool (idle plus leased).
    pub open: usize,
    /// Idle connections.
    pub idle: usize,
    /// Leased connections.
    pub leased: usize,
    /// Connections being opened.
    pub pending: usize,
    /// Checkouts waiting on this pool.
    pub waiting: usize,
    /// Blocked for reconfiguration.
    pub blocked: bool,
    /// Disconnected.
    pub closed: bool,
}

struct PoolState<T> {
    idle: VecDeque<T>,
    open: usize,
    pending: usize,
    waiting: usize,
    blocked: bool,
    closed: bool,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A tenant connection pool.
pub struct ConnectionPool<C: Connector> {
    id: u64,
    config: PoolConfig,
    connector: Arc<C>,
    limiter: Arc<ConnectionLimiter>,
    state: Mutex<PoolState<C::Connection>>,
    notify: Notify,
    stats: AtomicPoolStats,
}

enum Acquire<C: Connector> {
    Idle(C::Connection),
    Reserved(Reservation<C>),
    AtCapacity,
    AtCeiling,
}

/// A counted slot for a connection being opened.
struct Reservation<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    armed: bool,
}

impl<C: Connector> Drop for Reservation<C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().pending -= 1;
            self.pool.limiter.release();
            self.pool.notify.notify_waiters();
        }
    }
}

/// Registers a blocked checkout for the duration of its wait.
struct Waiter<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    on_ceiling: bool,
}

impl<'a, C: Connector> Waiter<'a, C> {
    fn new(pool: &'a ConnectionPool<C>, on_ceiling: bool) -> Self {
        pool.state.lock().waiting += 1;
        if on_ceiling {
            pool.limiter.waiting.fetch_add(1, Ordering::SeqCst);
        }
        Self { pool, on_ceiling }
    }
}

impl<C: Connector> Drop for Waiter<'_, C> {
    fn drop(&mut self) {
        self.pool.state.lock().waiting -= 1;
        if self.on_ceiling {
            self.pool.limiter.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool. No connection is opened until the first checkout.
    pub fn new(config: PoolConfig, connector: Arc<C>, limiter: Arc<ConnectionLimiter>) -> Arc<Self> {
        let pool = Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            connector,
            limiter,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open: 0,
                pending: 0,
                waiting: 0,
                blocked: false,
                closed: false,
            }),
            notify: Notify::new(),
            stats: AtomicPoolStats::new(),
        });
        let member: Weak<dyn IdleReclaim> = Arc::downgrade(&pool) as Weak<dyn IdleReclaim>;
        pool.limiter.register(member);
        trace!(pool = %pool.name(), id = pool.id, "Connection pool created");
        pool
    }

    /// Unique, never reused pool ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Qualified pool name.
    pub fn name(&self) -> &str {
        self.config.descriptor.name()
    }

    /// The descriptor this pool belongs to.
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.config.descriptor
    }

    /// The tenant this pool serves.
    pub fn tenant(&self) -> &TenantId {
        self.config.descriptor.tenant()
    }

    /// The configuration the pool was built from.
    pub fn pool_config(&self) -> &PoolConfig {
        &self.config
    }

    /// The shared limiter.
    pub fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }

    /// Local size limit.
    pub fn size(&self) -> usize {
        self.config.db.pool.size
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            size: self.size(),
            open: state.open,
            idle: state.idle.len(),
            leased: state.open - state.idle.len(),
            pending: state.pending,
            waiting: state.waiting,
            blocked: state.blocked,
            closed: state.closed,
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Whether the pool holds at least one live connection.
    pub fn is_connected(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.open > 0
    }

    /// Whether the pool has been disconnected.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stop (or resume) opening new connections.
    pub fn set_blocked(&self, blocked: bool) {
        self.state.lock().blocked = blocked;
        if !blocked {
            self.notify.notify_waiters();
        }
    }

    /// Lease a connection.
    pub async fn checkout(self: &Arc<Self>) -> TenantResult<PooledConnection<C>> {
        let started = Instant::now();
        let timeout = self.config.db.pool.checkout_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Armed before inspecting state so no wake-up is missed.
            let local = self.notify.notified();
            let global = self.limiter.notify.notified();
            tokio::pin!(local, global);
            local.as_mut().enable();
            global.as_mut().enable();

            let on_ceiling = match self.try_acquire()? {
                Acquire::Idle(connection) => {
                    trace!(pool = %self.name(), "Reusing idle connection");
                    return Ok(self.lease(connection, started));
                }
                Acquire::Reserved(reservation) => return self.open(reservation, started).await,
                Acquire::AtCeiling => {
                    if self.limiter.reclaim_idle_except(self.id) {
                        continue;
                    }
                    true
                }
                Acquire::AtCapacity => false,
            };

            let _waiter = Waiter::new(self, on_ceiling);
            // A sibling may have idled a connection before we registered.
            if on_ceiling && self.limiter.reclaim_idle_except(self.id) {
                continue;
            }

            trace!(pool = %self.name(), on_ceiling, "Waiting for a connection");
            tokio::select! {
                _ = &mut local => {}
                _ = &mut global => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.stats.record_timeout();
                    debug!(pool = %self.name(), timeout_ms = timeout.as_millis() as u64, "Checkout timed out");
                    return Err(TenantError::PoolExhausted {
                        pool: self.name().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    fn try_acquire(self: &Arc<Self>) -> TenantResult<Acquire<C>> {
        let mut stale = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TenantError::PoolClosed(self.name().to_string()));
            }
            loop {
                match state.idle.pop_back() {
                    Some(connection) if self.connector.is_valid(&connection) => {
                        break Acquire::Idle(connection);
                    }
                    Some(connection) => {
                        state.open -= 1;
                        stale.push(connection);
                    }
                    None if state.blocked || state.open + state.pending >= self.size() => {
                        break Acquire::AtCapacity;
                    }
                    None if !self.limiter.try_reserve() => break Acquire::AtCeiling,
                    None => {
                        state.pending += 1;
                        break Acquire::Reserved(Reservation {
                            pool: Arc::clone(self),
                            armed: true,
                        });
                    }
                }
            }
        };

        if !stale.is_empty() {
            let count = stale.len();
            drop(stale);
            for _ in 0..count {
                self.limiter.release();
            }
            self.stats.record_closed(count);
            debug!(pool = %self.name(), count, "Dropped invalid idle connections");
        }
        Ok(outcome)
    }

    async fn open(
        self: &Arc<Self>,
        mut reservation: Reservation<C>,
        started: Instant,
    ) -> TenantResult<PooledConnection<C>> {
        let connection = self
            .connector
            .connect(&self.config.db)
            .await
            .map_err(TenantError::Connection)?;

        let mut state = self.state.lock();
        state.pending -= 1;
        reservation.armed = false;

        if state.closed {
            drop(state);
            drop(connection);
            self.limiter.release();
            self.notify.notify_waiters();
            return Err(TenantError::PoolClosed(self.name().to_string()));
        }

        state.open += 1;
        let open = state.open;
        drop(state);

        self.stats.record_opened();
        debug!(pool = %self.name(), open, global_open = self.limiter.open(), "Opened physical connection");
        Ok(self.lease(connection, started))
    }

    fn lease(self: &Arc<Self>, connection: C::Connection, started: Instant) -> PooledConnection<C> {
        self.stats.record_acquire(started.elapsed());
        PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(self),
        }
    }

    fn checkin(&self, connection: C::Connection) {
        let mut state = self.state.lock();
        let hand_off = state.closed
            || !self.connector.is_valid(&connection)
            || (state.waiting == 0 && self.limiter.waiting() > 0);

        if hand_off {
            state.open -= 1;
            drop(state);
            drop(connection);
            self.limiter.release();
            self.stats.record_closed(1);
        } else {
            state.idle.push_back(connection);
            drop(state);
        }

        self.stats.record_release();
        self.notify.notify_waiters();
        trace!(pool = %self.name(), closed = hand_off, "Connection checked in");
    }

    fn discard(&self, connection: C::Connection) {
        self.state.lock().open -= 1;
        drop(connection);
        self.limiter.release();
        self.stats.record_release();
        self.stats.record_closed(1);
        self.notify.notify_waiters();
    }

    /// Close idle connections and refuse further checkouts.
    ///
    /// Leased connections are closed as they come back.
    pub fn disconnect(&self) {
        let drained: Vec<C::Connection> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open -= drained.len();
            drained
        };

        let closed = drained.len();
        drop(drained);
        for _ in 0..closed {
            self.limiter.release();
        }
        self.stats.record_closed(closed);
        self.notify.notify_waiters();
        info!(pool = %self.name(), id = self.id, closed, "Connection pool disconnected");
    }
}

impl<C: Connector> IdleReclaim for ConnectionPool<C> {
    fn pool_id(&self) -> u64 {
        self.id
    }

    fn reclaim_idle(&self) -> bool {
        let connection = {
            let mut state = self.state.lock();
            let connection = state.idle.pop_front();
            if connection.is_some() {
                state.open -= 1;
            }
            connection
        };
        let Some(connection) = connection else {
            return false;
        };

        drop(connection);
        self.limiter.release();
        self.stats.record_closed(1);
        debug!(pool = %self.name(), limiter = %self.limiter.name(), "Closed idle connection for a sibling pool");
        true
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let idle = state.idle.len();
        state.idle.clear();
        for _ in 0..idle {
            self.limiter.release();
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

/// A leased connection, checked back in on drop.
pub struct PooledConnection<C: Connector> {
    connection: Option<C::Connection>,
    pool: Arc<ConnectionPool<C>>,
}

impl<C: Connector> PooledConnection<C> {
    /// The pool the connection came from.
    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// The tenant the connection serves.
    pub fn tenant(&self) -> &TenantId {
        self.pool.tenant()
    }

    /// Close the physical connection instead of returning it.
    pub fn discard(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.discard(connection);
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("connection used after checkin"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.connection {
            Some(connection) => connection,
            None => unreachable!("connection used after checkin"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.checkin(connection);
        }
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ConnectionOwner, NamedOwner};
    use crate::manager::{Role, Shard};
    use crate::testing::{MemoryConnector, MemoryServer};

    fn pool_config(tenant: &str, size: usize, timeout_ms: u64) -> PoolConfig {
        let owner: Arc<dyn ConnectionOwner> = Arc::new(NamedOwner::primary("primary"));
        PoolConfig {
            descriptor: ConnectionDescriptor::new(owner, tenant),
            db: DbConfig::new("memory")
                .with_database("app")
                .with_pool_size(size)
                .with_checkout_timeout(Duration::from_millis(timeout_ms)),
            role: Role::writing(),
            shard: Shard::default_shard(),
        }
    }

    fn pool(
        server: &Arc<MemoryServer>,
        limiter: &Arc<ConnectionLimiter>,
        tenant: &str,
        size: usize,
        timeout_ms: u64,
    ) -> Arc<ConnectionPool<MemoryConnector>> {
        ConnectionPool::new(
            pool_config(tenant, size, timeout_ms),
            Arc::new(MemoryConnector::new(server.clone())),
            limiter.clone(),
        )
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let server = MemoryServer::new();
        let limiter = Arc::new(ConnectionLimiter::unlimited("primary"));
        let pool = pool(&server, &limiter, "t1", 2, 100);

        drop(pool.checkout().await.unwrap());
        drop(pool.checkout().await.unwrap());

        assert_eq!(server.total_connects(), 1);
        assert_eq!(pool.status().idle, 1);
        assert!(pool.is_connected());
        assert_eq!(pool.stats().connections_acquired, 2);
    }

    #[tokio::test]
    async fn test_local_limit_times_out() {
        let server = MemoryServer::new();
        let limiter = Arc::new(ConnectionLimiter::unlimited("primary"));
        let pool = pool(&server, &limiter, "t1", 1, 30);

        let held = pool.checkout().await.unwrap();
        let err = pool.checkout().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(pool.stats().timeouts, 1);

        drop(held);
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_checked_in_connection() {
        let server = MemoryServer::new();
        let limiter = Arc::new(ConnectionLimiter::unlimited("primary"));
        let pool = pool(&server, &limiter, "t1", 1, 1000);

        let held = pool.checkout().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.checkout().await.map(|conn| conn.database().to_string()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), "app");
        assert_eq!(server.total_connects(), 1);
    }

    #[tokio::test]
    async fn test_global_ceiling_hands_over_slot() {
        let server = MemoryServer::new();
        let limiter = Arc::new(ConnectionLimiter::new("primary", 2));
        let a = pool(&server, &limiter, "a", 2, 1000);
        let b = pool(&server, &limiter, "b", 2, 1000);

        let first = a.checkout().await.unwrap();
        let _second = a.checkout().await.unwrap();
        assert_eq!(limiter.open(), 2);

        let waiter = tokio::spawn({
            let b = b.clone();
            async move { b.checkout().await.map(|conn| conn.tenant().clone()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.waiting(), 1);

        drop(first);
        assert_eq!(waiter.await.unwrap().unwrap().as_str(), "b");
        assert_eq!(a.status().open, 1);
        assert!(server.peak_connections() <= 2);
    }

    #[tokio::test]
    async fn test_sibling_idle_connection_is_reclaimed() {
        let server = MemoryServer::new();
        let limiter = Arc::new(ConnectionLimiter::new("primary", 1));
        let a = pool(&server, &limiter, "a", 1, 50);
        let b = pool(&server, &limiter, "b", 1, 50);

        drop(a.checkout().await.unwrap());
        assert_eq!(a.status().idle, 1);

        let conn = b.checkout().await.unwrap();
        assert_eq!(a.status().open, 0);
        assert_eq!(limiter.open(), 1);
        assert_eq!(server.open_connections(), 1);
        drop(conn);
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_reservation() {
        let server = MemoryServer::new();
        server.set_connect_delay(Duration::from_millis(200));
        let limiter = Arc::new(ConnectionLimiter::new("primary", 1));
        let pool = pool(&server, &limiter, "t1", 1, 1000);

        let result = tokio::time::timeout(Duration::from_millis(10), pool.checkout()).await;
        assert!(result.is_err());
        assert_eq!(limiter.open(), 0);
        assert_eq!(pool.status().pending, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_passes_through() {
        let server = MemoryServer::new();
        server.refuse("app");
        let limiter = Arc::new(ConnectionLimiter::new("primary", 1));
        let pool = pool(&server, &limiter, "t1", 1, 100);

        let err = pool.checkout().await.unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert_eq!(limiter.open(), 0);

        server.accept("app");
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect() {
        let server = MemoryServer::new();
        let limiter = Arc::new(ConnectionLimiter::unlimited("primary"));
        let pool = pool(&server, &limiter, "t1", 2, 100);

        let leased = pool.checkout().await.unwrap();
        drop(pool.checkout().await.unwrap());
        assert_eq!(server.open_connections(), 2);

        pool.disconnect();
        assert_eq!(server.open_connections(), 1);
        assert!(matches!(pool.checkout().await, Err(TenantError::PoolClosed(_))));

        drop(leased);
        assert_eq!(server.open_connections(), 0);
        assert_eq!(limiter.open(), 0);
        assert!(!pool.is_connected());
    }

    #[tokio::test]
    async fn test_discard_and_blocked() {
        let server = MemoryServer::new();
        let limiter = Arc::new(ConnectionLimiter::unlimited("primary"));
        let pool = pool(&server, &limiter, "t1", 2, 30);

        pool.checkout().await.unwrap().discard();
        assert_eq!(pool.status().open, 0);
        assert_eq!(server.open_connections(), 0);

        pool.set_blocked(true);
        assert!(pool.checkout().await.unwrap_err().is_timeout());
        pool.set_blocked(false);
        assert!(pool.checkout().await.is_ok());
    }

    #[test]
    fn test_limits_registry() {
        let limits = ConnectionLimits::new().with_ceiling("primary", 5);
        let first = limits.limiter("primary");
        assert_eq!(first.max(), 5);
        assert!(Arc::ptr_eq(&first, &limits.limiter("primary")));
        assert_eq!(limits.limiter("analytics").max(), usize::MAX);
        assert!(limits.get("other").is_none());
    }
}
