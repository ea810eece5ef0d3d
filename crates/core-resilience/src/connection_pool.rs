//! Generic connection pool with scoped leases
//!
//! Resources are created on demand through the connect-level resilience
//! pipeline, handed out as exclusive [`PoolLease`]s and returned to an
//! unordered idle set when the lease ends. Release is synchronous and
//! re-checks the health predicate, so a broken handle is never pooled again.

use super::error::ResilienceError;
use super::pipeline::ResiliencePipeline;
use futures::future::BoxFuture;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How `max_size` is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizePolicy {
    /// Hard cap on leased resources; acquirers beyond it wait up to
    /// `acquire_timeout` and then fail with `PoolExhausted`.
    #[default]
    Capped,
    /// Creation is never blocked; `max_size` only limits how many idle
    /// resources are kept when leases are returned.
    Advisory,
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: usize,
    /// Whether `max_size` blocks creation
    pub size_policy: SizePolicy,
    /// Timeout for obtaining a slot under `SizePolicy::Capped`
    pub acquire_timeout: Duration,
    /// Maximum time a connection can remain idle before being closed
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime of a connection
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            size_policy: SizePolicy::Capped,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(300)), // 5 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
        }
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Health predicate, checked on acquire and on release. Must not block.
    fn is_healthy(&self, conn: &T) -> bool;

    /// Dispose of a connection that leaves the pool
    fn close(&self, conn: T) {
        drop(conn);
    }
}

/// Observer for pool lifecycle events
///
/// Used by the metrics layer; every method defaults to a no-op.
pub trait PoolListener: Send + Sync {
    /// A new resource was created
    fn on_opened(&self) {}

    /// A resource was disposed of
    fn on_closed(&self) {}

    /// Idle/leased counts changed.
    ///
    /// Called with the pool state locked, so snapshots arrive in order.
    /// Implementations must not block or call back into the pool.
    fn on_idle_changed(&self, _idle: usize, _leased: usize) {}
}

/// Listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl PoolListener for NoopListener {}

/// A connection wrapper that tracks metadata
struct PooledConnection<T> {
    conn: T,
    created_at: Instant,
    last_used: Instant,
}

impl<T> PooledConnection<T> {
    fn new(conn: T) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        if let Some(idle_timeout) = config.idle_timeout {
            if self.last_used.elapsed() > idle_timeout {
                return true;
            }
        }

        if let Some(max_lifetime) = config.max_lifetime {
            if self.created_at.elapsed() > max_lifetime {
                return true;
            }
        }

        false
    }
}

/// Mutable pool state, guarded by a synchronous mutex
struct PoolState<T> {
    idle: Vec<PooledConnection<T>>,
    leased: usize,
    created: u64,
    closed: u64,
    shut_down: bool,
}

struct PoolInner<T: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    connect: ResiliencePipeline,
    listener: Arc<dyn PoolListener>,
    state: Mutex<PoolState<T>>,
    /// Present only under `SizePolicy::Capped`
    slots: Option<Arc<Semaphore>>,
}

impl<T: Send + 'static> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pop an idle resource that is healthy and unexpired.
    ///
    /// Anything found unusable on the way is closed.
    fn take_idle(&self) -> Option<PooledConnection<T>> {
        let mut rejected = Vec::new();
        let found = {
            let mut state = self.lock();
            let mut found = None;
            while let Some(pooled) = state.idle.pop() {
                if pooled.is_expired(&self.config) || !self.factory.is_healthy(&pooled.conn) {
                    state.closed += 1;
                    rejected.push(pooled);
                    continue;
                }
                state.leased += 1;
                found = Some(pooled);
                break;
            }
            if found.is_some() {
                self.listener.on_idle_changed(state.idle.len(), state.leased);
            }
            found
        };

        if !rejected.is_empty() {
            debug!(count = rejected.len(), "closing unusable idle connections");
        }
        for pooled in rejected {
            self.factory.close(pooled.conn);
            self.listener.on_closed();
        }
        found
    }

    fn track_created(&self) {
        self.listener.on_opened();
        let mut state = self.lock();
        state.created += 1;
        state.leased += 1;
        self.listener.on_idle_changed(state.idle.len(), state.leased);
    }

    /// Return a leased resource. Never awaits.
    fn release(&self, mut pooled: PooledConnection<T>, discard: bool) {
        let healthy = !discard && self.factory.is_healthy(&pooled.conn);
        let rejected = {
            let mut state = self.lock();
            state.leased = state.leased.saturating_sub(1);
            let keep = healthy
                && !state.shut_down
                && !pooled.is_expired(&self.config)
                && state.idle.len() < self.config.max_size;
            let rejected = if keep {
                pooled.last_used = Instant::now();
                state.idle.push(pooled);
                None
            } else {
                state.closed += 1;
                Some(pooled)
            };
            self.listener.on_idle_changed(state.idle.len(), state.leased);
            rejected
        };

        if let Some(pooled) = rejected {
            trace!(healthy, "closing returned connection");
            self.factory.close(pooled.conn);
            self.listener.on_closed();
        }
    }
}

/// A generic connection pool
///
/// Cloning is cheap; clones share the same idle set.
///
/// # Example
/// ```no_run
/// use courier_core_resilience::{
///     ConnectionFactory, ConnectionPool, OperationKind, PipelineConfig, PoolConfig,
///     ResilienceError, ResiliencePipeline,
/// };
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # struct Channel;
/// struct ChannelFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<Channel> for ChannelFactory {
///     async fn create(&self) -> Result<Channel, ResilienceError> {
///         Ok(Channel)
///     }
///
///     fn is_healthy(&self, _conn: &Channel) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let connect = ResiliencePipeline::new("amqp", OperationKind::Connect, PipelineConfig::default());
/// let pool = ConnectionPool::new(Arc::new(ChannelFactory), PoolConfig::default(), connect);
///
/// let cancel = CancellationToken::new();
/// let channel = pool.acquire(&cancel).await?;
/// // Use the channel...
/// drop(channel); // back to the idle set
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("connect", &self.inner.connect.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a new connection pool.
    ///
    /// `connect` guards every call to [`ConnectionFactory::create`].
    pub fn new(
        factory: Arc<dyn ConnectionFactory<T>>,
        config: PoolConfig,
        connect: ResiliencePipeline,
    ) -> Self {
        Self::with_listener(factory, config, connect, Arc::new(NoopListener))
    }

    /// Create a pool that reports lifecycle events to `listener`
    pub fn with_listener(
        factory: Arc<dyn ConnectionFactory<T>>,
        config: PoolConfig,
        connect: ResiliencePipeline,
        listener: Arc<dyn PoolListener>,
    ) -> Self {
        let slots = match config.size_policy {
            SizePolicy::Capped => Some(Arc::new(Semaphore::new(
                config.max_size.min(Semaphore::MAX_PERMITS),
            ))),
            SizePolicy::Advisory => None,
        };
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                connect,
                listener,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    leased: 0,
                    created: 0,
                    closed: 0,
                    shut_down: false,
                }),
                slots,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The connect-level pipeline used for resource creation
    pub fn connect_pipeline(&self) -> &ResiliencePipeline {
        &self.inner.connect
    }

    /// Lease a resource.
    ///
    /// Any idle, healthy resource may be returned; there is no reuse order.
    /// When none is idle a new one is created through the connect pipeline.
    /// Cancellation stops waiting and prevents further connect retries but
    /// does not interrupt a connect attempt that has already started.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PoolLease<T>, ResilienceError> {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }
        if self.inner.lock().shut_down {
            return Err(ResilienceError::PoolClosed);
        }

        let permit = match &self.inner.slots {
            Some(slots) => Some(self.wait_for_slot(slots, cancel).await?),
            None => None,
        };

        if let Some(pooled) = self.inner.take_idle() {
            return Ok(PoolLease::new(pooled, Arc::clone(&self.inner), permit));
        }

        let factory = &self.inner.factory;
        let conn = self
            .inner
            .connect
            .execute(cancel, move || factory.create())
            .await?;

        self.inner.track_created();
        debug!(pipeline = %self.inner.connect.name(), "opened new pooled connection");
        Ok(PoolLease::new(
            PooledConnection::new(conn),
            Arc::clone(&self.inner),
            permit,
        ))
    }

    async fn wait_for_slot(
        &self,
        slots: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ResilienceError> {
        if let Ok(permit) = Arc::clone(slots).try_acquire_owned() {
            return Ok(permit);
        }

        let timeout = self.inner.config.acquire_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
            waited = tokio::time::timeout(timeout, Arc::clone(slots).acquire_owned()) => match waited {
                Ok(Ok(permit)) => Ok(permit),
                // The semaphore is closed by shutdown
                Ok(Err(_)) => Err(ResilienceError::PoolClosed),
                Err(_) => Err(ResilienceError::PoolExhausted),
            },
        }
    }

    /// Run `f` with a leased resource, releasing it on every exit path.
    pub async fn with_lease<R, F>(&self, cancel: &CancellationToken, f: F) -> Result<R, ResilienceError>
    where
        F: for<'a> FnOnce(&'a T) -> BoxFuture<'a, R>,
    {
        let lease = self.acquire(cancel).await?;
        let output = f(&lease).await;
        lease.release();
        Ok(output)
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased,
            created: state.created,
            closed: state.closed,
            max_size: self.inner.config.max_size,
        }
    }

    /// Close all idle connections
    pub fn close_idle(&self) {
        let drained = {
            let mut state = self.inner.lock();
            let drained = std::mem::take(&mut state.idle);
            state.closed += drained.len() as u64;
            self.inner.listener.on_idle_changed(0, state.leased);
            drained
        };

        for pooled in drained {
            self.inner.factory.close(pooled.conn);
            self.inner.listener.on_closed();
        }
    }

    /// Close idle connections and refuse further acquires.
    ///
    /// Leases still outstanding close their resource when they end.
    pub fn shutdown(&self) {
        self.inner.lock().shut_down = true;
        if let Some(slots) = &self.inner.slots {
            slots.close();
        }
        self.close_idle();
        debug!(pipeline = %self.inner.connect.name(), "connection pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }
}

/// Exclusive ownership of one pooled resource
///
/// The resource goes back to the pool when the lease is dropped, including
/// when the future holding it is cancelled.
#[must_use = "dropping a lease returns the resource immediately"]
pub struct PoolLease<T: Send + 'static> {
    conn: Option<PooledConnection<T>>,
    pool: Arc<PoolInner<T>>,
    // Dropped after the resource is back in the idle set
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T: Send + 'static> PoolLease<T> {
    fn new(
        conn: PooledConnection<T>,
        pool: Arc<PoolInner<T>>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }

    /// Return the resource to the pool (closed instead if unhealthy)
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, false);
        }
    }

    /// Close the resource instead of returning it
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, true);
        }
    }

    /// Whether the factory still considers the resource healthy
    pub fn is_healthy(&self) -> bool {
        self.pool.factory.is_healthy(self)
    }

    /// Time since the underlying resource was created
    pub fn age(&self) -> Duration {
        self.conn
            .as_ref()
            .map(|c| c.created_at.elapsed())
            .unwrap_or_default()
    }
}

impl<T: Send + 'static> Deref for PoolLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.conn {
            Some(pooled) => &pooled.conn,
            // `release` and `discard` consume the lease
            None => unreachable!("pool lease used after release"),
        }
    }
}

impl<T: Send + 'static> Drop for PoolLease<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, false);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for PoolLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("pipeline", &self.pool.connect.name())
            .field("age", &self.age())
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of idle connections
    pub idle: usize,
    /// Number of leased connections
    pub leased: usize,
    /// Connections created over the pool's lifetime
    pub created: u64,
    /// Connections closed over the pool's lifetime
    pub closed: u64,
    /// Configured maximum pool size
    pub max_size: usize,
}

impl PoolStats {
    /// Leased connections as a percentage of `max_size`
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.leased as f64 / self.max_size as f64) * 100.0
        }
    }
}
