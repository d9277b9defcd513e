//! Bounded connection pooling
//!
//! Each cluster gets one [`Pool`]: a bounded set of driver sessions spread
//! across the cluster's endpoints. Capacity is a semaphore whose permits
//! stand for the right to hold a checked-out connection; a caller first wins
//! a permit (waiting up to the acquire timeout in FIFO order), then either
//! reuses a validated idle session or opens a fresh one. Connecting happens
//! under the permit and outside the pool lock, so slow handshakes never
//! block other callers and a failed connect gives the permit straight back.
//!
//! Idle sessions hold no permits. Releasing a healthy lease parks the
//! session before the permit is returned, so a woken waiter always finds
//! either the parked session or a free slot to connect into. A steered
//! acquire that bypasses parked sessions on avoided endpoints instead
//! evicts one of them when the pool is full, so idle and leased sessions
//! together never exceed the configured size.

pub mod handle;

pub use handle::{ConnectionHandle, HandleState, Lease};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::{Endpoint, EndpointSnapshot, EndpointState, Selector};
use crate::config::{ClusterConfig, RetryPolicy};
use crate::session::{BoxError, Connector};

/// Errors surfaced by pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No endpoint accepted a connection
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: Endpoint,
        #[source]
        source: BoxError,
    },

    /// Every slot stayed leased for the whole acquire timeout
    #[error("Pool for cluster '{cluster}' exhausted after {waited:?} ({in_use}/{max_size} leased)")]
    Exhausted {
        cluster: String,
        waited: Duration,
        in_use: usize,
        max_size: usize,
    },

    /// The cluster has no endpoints left in rotation
    #[error("No endpoints available for cluster '{cluster}'")]
    NoEndpoints { cluster: String },

    /// The pool has been shut down
    #[error("Pool for cluster '{cluster}' is closed")]
    Closed { cluster: String },
}

/// Pool sizing and lifecycle limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum connections the pool may hold, idle and leased combined
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Idle connections the maintenance sweep keeps warm
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// How long an acquire waits for a free slot before giving up
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Per-endpoint connect deadline
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Idle connections older than this are evicted
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// How long a liveness verdict stays trusted before the next checkout
    /// re-probes the session
    #[serde(default = "default_liveness_check_secs")]
    pub liveness_check_secs: u64,

    /// Interval between maintenance sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Replace a connection after this many units of work; None disables
    /// recycling
    #[serde(default = "default_recycle_after_ops")]
    pub recycle_after_ops: Option<u64>,
}

fn default_max_size() -> usize {
    10
}

fn default_min_idle() -> usize {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_max_idle_secs() -> u64 {
    90
}

fn default_liveness_check_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_recycle_after_ops() -> Option<u64> {
    Some(10_000)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            min_idle: default_min_idle(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_idle_secs: default_max_idle_secs(),
            liveness_check_secs: default_liveness_check_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            recycle_after_ops: default_recycle_after_ops(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn liveness_check(&self) -> Duration {
        Duration::from_secs(self.liveness_check_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Cluster the pool serves
    pub cluster: String,

    /// Idle connections parked in the pool
    pub idle: usize,

    /// Connections currently leased out
    pub in_use: usize,

    /// Configured capacity
    pub max_size: usize,

    /// Connections opened over the pool's lifetime
    pub total_created: u64,

    /// Checkouts served from the idle set
    pub total_reused: u64,

    /// Connections closed for staleness, breakage, or recycling
    pub total_evicted: u64,

    /// Successful checkouts
    pub total_acquired: u64,

    /// Acquires that timed out waiting for a slot
    pub acquire_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    in_use: AtomicUsize,
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_evicted: AtomicU64,
    total_acquired: AtomicU64,
    acquire_timeouts: AtomicU64,
}

struct PoolState<S> {
    endpoints: Vec<Arc<EndpointState>>,
    idle: VecDeque<ConnectionHandle<S>>,
}

pub(crate) struct PoolInner<C: Connector> {
    cluster: String,
    connector: Arc<C>,
    config: PoolConfig,
    retry: RetryPolicy,
    selector: Selector,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<C::Session>>,
    counters: Counters,
    closed: AtomicBool,
    next_handle_id: AtomicU64,
}

/// Bounded connection pool for one cluster.
///
/// Cheap to clone; clones share the same pool.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("cluster", &self.inner.cluster)
            .field("max_size", &self.inner.config.max_size)
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Build a pool for `cluster` from its configuration.
    ///
    /// No connections are opened here; call [`Pool::prefill`] to warm the
    /// pool eagerly, otherwise sessions are created on first acquire.
    pub fn new(cluster: impl Into<String>, config: &ClusterConfig, connector: Arc<C>) -> Self {
        let cluster = cluster.into();
        let mut pool_config = config.pool.clone();
        pool_config.max_size = pool_config.max_size.max(1);
        pool_config.min_idle = pool_config.min_idle.min(pool_config.max_size);

        let endpoints: Vec<Arc<EndpointState>> = config
            .endpoints
            .iter()
            .map(|endpoint| Arc::new(EndpointState::new(endpoint.clone(), config.circuit.clone())))
            .collect();

        debug!(
            cluster = %cluster,
            endpoints = endpoints.len(),
            max_size = pool_config.max_size,
            "Creating connection pool"
        );

        let semaphore = Arc::new(Semaphore::new(pool_config.max_size));

        Self {
            inner: Arc::new(PoolInner {
                cluster,
                connector,
                retry: config.retry.clone(),
                selector: Selector::new(config.strategy),
                semaphore,
                state: Mutex::new(PoolState {
                    endpoints,
                    idle: VecDeque::new(),
                }),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
                next_handle_id: AtomicU64::new(1),
                config: pool_config,
            }),
        }
    }

    /// Cluster this pool serves.
    pub fn name(&self) -> &str {
        self.inner.cluster()
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Retry policy configured for this cluster.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Check out a connection, waiting up to the acquire timeout for a slot.
    pub async fn acquire(&self) -> Result<Lease<C>, PoolError> {
        self.acquire_avoiding(&HashSet::new()).await
    }

    /// Check out a connection, steering away from `avoid` endpoints.
    ///
    /// Endpoints in `avoid` lose selection preference but stay eligible when
    /// nothing else is available. The slot wait is FIFO: callers already
    /// queued are served before later arrivals, and a caller that times out
    /// leaves nothing leased behind.
    pub async fn acquire_avoiding(&self, avoid: &HashSet<Endpoint>) -> Result<Lease<C>, PoolError> {
        let inner = &self.inner;

        if inner.is_closed() {
            return Err(PoolError::Closed {
                cluster: inner.cluster().to_string(),
            });
        }

        let started = Instant::now();
        let permit = match timeout(
            inner.config.acquire_timeout(),
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(PoolError::Closed {
                    cluster: inner.cluster().to_string(),
                })
            }
            Err(_) => {
                inner.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                let in_use = inner.counters.in_use.load(Ordering::Relaxed);
                warn!(
                    cluster = %inner.cluster(),
                    waited = ?started.elapsed(),
                    in_use,
                    max_size = inner.config.max_size,
                    "Acquire timed out with every slot leased"
                );
                return Err(PoolError::Exhausted {
                    cluster: inner.cluster().to_string(),
                    waited: started.elapsed(),
                    in_use,
                    max_size: inner.config.max_size,
                });
            }
        };

        if inner.is_closed() {
            return Err(PoolError::Closed {
                cluster: inner.cluster().to_string(),
            });
        }

        // Prefer a parked session that still passes validation. Probing runs
        // outside the pool lock; a popped session counts as leased from the
        // moment it leaves the idle set, so capacity checks elsewhere see it.
        loop {
            let candidate = {
                let mut state = inner.state.lock().await;
                let picked = inner.pick_idle(&mut state, avoid);
                if picked.is_some() {
                    inner.counters.in_use.fetch_add(1, Ordering::Relaxed);
                }
                picked
            };
            let Some(mut handle) = candidate else { break };

            if handle.endpoint_state().is_retired() {
                debug!(
                    cluster = %inner.cluster(),
                    endpoint = %handle.endpoint(),
                    "Discarding connection to a removed endpoint"
                );
                inner.discard_candidate(handle).await;
                continue;
            }
            if handle.is_stale(inner.config.max_idle()) {
                debug!(
                    cluster = %inner.cluster(),
                    endpoint = %handle.endpoint(),
                    idle_for = ?handle.idle_for(),
                    "Discarding stale idle connection"
                );
                inner.discard_candidate(handle).await;
                continue;
            }
            if handle.needs_verification(inner.config.liveness_check())
                && !handle.verify_alive().await
            {
                debug!(
                    cluster = %inner.cluster(),
                    endpoint = %handle.endpoint(),
                    "Discarding dead idle connection"
                );
                inner.discard_candidate(handle).await;
                continue;
            }

            return Ok(self.lease_out(handle, permit, true));
        }

        // Nothing idle: open a fresh session, rotating across endpoints
        // until one accepts or none are left worth trying.
        let endpoints = { inner.state.lock().await.endpoints.clone() };
        let mut avoid = avoid.clone();
        let mut failed: HashSet<Endpoint> = HashSet::new();
        let mut last_err: Option<(Endpoint, BoxError)> = None;

        for _ in 0..endpoints.len() {
            let Some(index) = inner.selector.select(&endpoints, &avoid) else {
                break;
            };
            let target = Arc::clone(&endpoints[index]);
            if failed.contains(target.endpoint()) {
                // The selector has nothing better left than an endpoint that
                // already refused us this call.
                break;
            }

            match inner.connect_to(&target).await {
                Ok(handle) => {
                    // Commit the new session against capacity. When the pool
                    // is full of parked sessions the steering bypassed, one
                    // of them gives up its slot.
                    let victim = {
                        let mut state = inner.state.lock().await;
                        let full = state.idle.len()
                            + inner.counters.in_use.load(Ordering::Relaxed)
                            >= inner.config.max_size;
                        let victim = if full {
                            inner.take_capacity_victim(&mut state, &avoid)
                        } else {
                            None
                        };
                        inner.counters.in_use.fetch_add(1, Ordering::Relaxed);
                        victim
                    };
                    if let Some(victim) = victim {
                        debug!(
                            cluster = %inner.cluster(),
                            endpoint = %victim.endpoint(),
                            "Evicting parked connection to make room for a steered connect"
                        );
                        inner.discard(victim).await;
                    }
                    return Ok(self.lease_out(handle, permit, false));
                }
                Err(reason) => {
                    if target.record_connect_failure() {
                        warn!(
                            cluster = %inner.cluster(),
                            endpoint = %target.endpoint(),
                            error = %reason,
                            "Endpoint gated after repeated connect failures"
                        );
                    } else {
                        warn!(
                            cluster = %inner.cluster(),
                            endpoint = %target.endpoint(),
                            error = %reason,
                            "Connect failed"
                        );
                    }
                    avoid.insert(target.endpoint().clone());
                    failed.insert(target.endpoint().clone());
                    last_err = Some((target.endpoint().clone(), reason));
                }
            }
        }

        match last_err {
            Some((endpoint, source)) => Err(PoolError::ConnectFailed { endpoint, source }),
            None => Err(PoolError::NoEndpoints {
                cluster: inner.cluster().to_string(),
            }),
        }
    }

    /// Open connections until `min_idle` are parked, without exceeding
    /// capacity. Returns how many were opened.
    pub async fn prefill(&self) -> usize {
        self.inner.top_up().await
    }

    /// Evict idle connections past the idle limit or pointing at removed
    /// endpoints. Returns how many were closed.
    pub async fn evict_stale(&self) -> usize {
        self.inner.evict_stale().await
    }

    /// Take an endpoint out of rotation and close its idle connections.
    ///
    /// Leased connections to the endpoint finish their current work and are
    /// closed on release. Returns how many idle connections were evicted.
    pub async fn remove_endpoint(&self, endpoint: &Endpoint) -> usize {
        self.inner.remove_endpoint(endpoint).await
    }

    /// Spawn the periodic maintenance sweep: stale eviction plus warm-up to
    /// `min_idle`. The task stops once the pool is closed.
    pub fn start_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let period = self.inner.config.sweep_interval().max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                let evicted = pool.inner.evict_stale().await;
                let opened = pool.inner.top_up().await;
                if evicted > 0 || opened > 0 {
                    debug!(
                        cluster = %pool.name(),
                        evicted,
                        opened,
                        "Maintenance sweep finished"
                    );
                }
            }
        })
    }

    pub async fn stats(&self) -> PoolStats {
        self.inner.stats().await
    }

    /// Per-endpoint counters and gate state.
    pub async fn endpoints(&self) -> Vec<EndpointSnapshot> {
        self.inner.endpoints().await
    }

    /// Shut the pool down: fail waiting and future acquires, close every
    /// idle connection. Leased connections are closed as they come back.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Wrap a handle in a lease. The caller has already counted the handle
    /// as in use at its commitment point, under the state lock.
    fn lease_out(
        &self,
        mut handle: ConnectionHandle<C::Session>,
        permit: OwnedSemaphorePermit,
        reused: bool,
    ) -> Lease<C> {
        handle.mark_in_use();
        handle.endpoint_state().lease_started();
        self.inner.counters.total_acquired.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.inner.counters.total_reused.fetch_add(1, Ordering::Relaxed);
            debug!(
                cluster = %self.inner.cluster(),
                endpoint = %handle.endpoint(),
                id = handle.id(),
                "Leasing pooled connection"
            );
        }
        Lease::new(Arc::clone(&self.inner), handle, permit)
    }
}

impl<C: Connector> PoolInner<C> {
    pub(crate) fn cluster(&self) -> &str {
        &self.cluster
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pop the idle session to lease for this acquire, or None when a fresh
    /// connect is the better move. Must be called with the state lock held.
    ///
    /// A parked session on an avoided endpoint is never preferred over
    /// connecting to an endpoint the caller has not tried; the selector's
    /// choice decides. When everything has been tried the selector relaxes
    /// and parked sessions win again.
    fn pick_idle(
        &self,
        state: &mut PoolState<C::Session>,
        avoid: &HashSet<Endpoint>,
    ) -> Option<ConnectionHandle<C::Session>> {
        if state.idle.is_empty() {
            return None;
        }
        let Some(index) = self.selector.select(&state.endpoints, avoid) else {
            return state.idle.pop_front();
        };
        let preferred = state.endpoints[index].endpoint().clone();
        if let Some(pos) = state.idle.iter().position(|h| h.endpoint() == &preferred) {
            return state.idle.remove(pos);
        }
        if let Some(pos) = state
            .idle
            .iter()
            .position(|h| !avoid.contains(h.endpoint()))
        {
            return state.idle.remove(pos);
        }
        None
    }

    /// Pop one parked session to free a slot for a fresh connect, preferring
    /// a session on an avoided endpoint. Must be called with the state lock
    /// held.
    fn take_capacity_victim(
        &self,
        state: &mut PoolState<C::Session>,
        avoid: &HashSet<Endpoint>,
    ) -> Option<ConnectionHandle<C::Session>> {
        if let Some(pos) = state
            .idle
            .iter()
            .position(|h| avoid.contains(h.endpoint()))
        {
            return state.idle.remove(pos);
        }
        state.idle.pop_front()
    }

    async fn connect_to(
        &self,
        target: &Arc<EndpointState>,
    ) -> Result<ConnectionHandle<C::Session>, BoxError> {
        debug!(cluster = %self.cluster(), endpoint = %target.endpoint(), "Opening connection");
        let session = match timeout(
            self.config.connect_timeout(),
            self.connector.connect(target.endpoint()),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(
                    format!("Connect timed out after {:?}", self.config.connect_timeout()).into(),
                )
            }
        };

        target.record_connect();
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let total = self.counters.total_created.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            cluster = %self.cluster(),
            endpoint = %target.endpoint(),
            total_created = total,
            "Opened new connection"
        );
        Ok(ConnectionHandle::new(id, Arc::clone(target), session))
    }

    /// Close a connection that will not return to the pool.
    async fn discard(&self, handle: ConnectionHandle<C::Session>) {
        self.counters.total_evicted.fetch_add(1, Ordering::Relaxed);
        handle.close().await;
    }

    /// Drop a popped idle session that failed checkout validation. The pop
    /// counted it as in use, so the count comes back here.
    async fn discard_candidate(&self, handle: ConnectionHandle<C::Session>) {
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
        self.discard(handle).await;
    }

    /// Return a leased connection.
    ///
    /// `trusted` is false when the lease came back through the drop backstop
    /// instead of an explicit release; the session is kept but must pass a
    /// liveness probe before it is leased again.
    pub(crate) async fn release_handle(
        &self,
        mut handle: ConnectionHandle<C::Session>,
        permit: Option<OwnedSemaphorePermit>,
        healthy: bool,
        trusted: bool,
    ) {
        handle.endpoint_state().lease_finished();

        if healthy {
            handle.endpoint_state().record_success();
        } else if handle.endpoint_state().record_failure() {
            warn!(
                cluster = %self.cluster(),
                endpoint = %handle.endpoint(),
                "Endpoint gated after repeated work failures"
            );
        }

        let recycle = healthy && handle.due_for_recycle(self.config.recycle_after_ops);
        let keep = healthy
            && !recycle
            && !self.is_closed()
            && !handle.endpoint_state().is_retired();

        if keep {
            handle.mark_idle();
            if !trusted {
                handle.force_reverify();
            }
            debug!(
                cluster = %self.cluster(),
                endpoint = %handle.endpoint(),
                id = handle.id(),
                "Connection returned to pool"
            );
            // Parking and the lease-count drop happen under one lock hold,
            // so no capacity check ever sees the session in neither set.
            let mut state = self.state.lock().await;
            state.idle.push_back(handle);
            self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
            drop(state);
            // Wake a waiter only after the session is parked.
            drop(permit);
        } else {
            self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
            if recycle {
                debug!(
                    cluster = %self.cluster(),
                    endpoint = %handle.endpoint(),
                    use_count = handle.use_count(),
                    "Recycling connection after use limit"
                );
            } else if !healthy {
                handle.mark_broken();
                debug!(
                    cluster = %self.cluster(),
                    endpoint = %handle.endpoint(),
                    id = handle.id(),
                    "Closing broken connection"
                );
            }
            self.counters.total_evicted.fetch_add(1, Ordering::Relaxed);
            handle.close().await;
            drop(permit);
        }
    }

    /// Bookkeeping for a lease dropped where no runtime is left to run the
    /// release. The session closes with its own drop.
    pub(crate) fn note_lease_gone(&self, handle: &ConnectionHandle<C::Session>) {
        handle.endpoint_state().lease_finished();
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    async fn evict_stale(&self) -> usize {
        let max_idle = self.config.max_idle();
        let mut doomed = Vec::new();
        {
            let mut state = self.state.lock().await;
            let mut keep = VecDeque::with_capacity(state.idle.len());
            while let Some(handle) = state.idle.pop_front() {
                if handle.endpoint_state().is_retired() || handle.is_stale(max_idle) {
                    doomed.push(handle);
                } else {
                    keep.push_back(handle);
                }
            }
            state.idle = keep;
        }

        let count = doomed.len();
        for handle in doomed {
            debug!(
                cluster = %self.cluster(),
                endpoint = %handle.endpoint(),
                idle_for = ?handle.idle_for(),
                "Evicting idle connection"
            );
            self.discard(handle).await;
        }
        count
    }

    /// Open connections until `min_idle` are parked. Each open reserves a
    /// capacity permit, so warm-up never pushes the pool past `max_size`
    /// and never queues against callers; when the pool is busy it simply
    /// skips the fill.
    async fn top_up(&self) -> usize {
        if self.is_closed() || self.config.min_idle == 0 {
            return 0;
        }

        let mut opened = 0;
        loop {
            let (endpoints, idle_len) = {
                let state = self.state.lock().await;
                (state.endpoints.clone(), state.idle.len())
            };
            if idle_len >= self.config.min_idle {
                break;
            }
            if idle_len + self.counters.in_use.load(Ordering::Relaxed) >= self.config.max_size {
                break;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let none_tried = HashSet::new();
            let Some(index) = self.selector.select(&endpoints, &none_tried) else {
                break;
            };
            let target = Arc::clone(&endpoints[index]);

            match self.connect_to(&target).await {
                Ok(handle) => {
                    let mut state = self.state.lock().await;
                    if self.is_closed() {
                        drop(state);
                        self.discard(handle).await;
                        break;
                    }
                    // The pool may have filled up while this connect was in
                    // flight; parking then would overshoot the bound.
                    if state.idle.len() + self.counters.in_use.load(Ordering::Relaxed)
                        >= self.config.max_size
                    {
                        drop(state);
                        self.discard(handle).await;
                        break;
                    }
                    state.idle.push_back(handle);
                    drop(state);
                    drop(permit);
                    opened += 1;
                }
                Err(reason) => {
                    if target.record_connect_failure() {
                        warn!(
                            cluster = %self.cluster(),
                            endpoint = %target.endpoint(),
                            error = %reason,
                            "Endpoint gated after repeated connect failures"
                        );
                    } else {
                        warn!(
                            cluster = %self.cluster(),
                            endpoint = %target.endpoint(),
                            error = %reason,
                            "Warm-up connect failed"
                        );
                    }
                    break;
                }
            }
        }
        opened
    }

    async fn remove_endpoint(&self, endpoint: &Endpoint) -> usize {
        let mut doomed = Vec::new();
        {
            let mut state = self.state.lock().await;
            if let Some(pos) = state.endpoints.iter().position(|e| e.endpoint() == endpoint) {
                let target = state.endpoints.remove(pos);
                target.retire();
            }
            let mut keep = VecDeque::with_capacity(state.idle.len());
            while let Some(handle) = state.idle.pop_front() {
                if handle.endpoint() == endpoint {
                    doomed.push(handle);
                } else {
                    keep.push_back(handle);
                }
            }
            state.idle = keep;
        }

        let count = doomed.len();
        for handle in doomed {
            self.discard(handle).await;
        }
        info!(
            cluster = %self.cluster(),
            endpoint = %endpoint,
            evicted = count,
            "Endpoint removed from rotation"
        );
        count
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.semaphore.close();

        let drained: Vec<_> = {
            let mut state = self.state.lock().await;
            state.idle.drain(..).collect()
        };
        let closed_count = drained.len();
        for handle in drained {
            handle.close().await;
        }
        info!(cluster = %self.cluster(), closed = closed_count, "Pool closed");
    }

    async fn stats(&self) -> PoolStats {
        // Idle and in-use are read under one lock hold so the pair is a
        // consistent snapshot of the capacity bound.
        let (idle, in_use) = {
            let state = self.state.lock().await;
            (state.idle.len(), self.counters.in_use.load(Ordering::Relaxed))
        };
        PoolStats {
            cluster: self.cluster.clone(),
            idle,
            in_use,
            max_size: self.config.max_size,
            total_created: self.counters.total_created.load(Ordering::Relaxed),
            total_reused: self.counters.total_reused.load(Ordering::Relaxed),
            total_evicted: self.counters.total_evicted.load(Ordering::Relaxed),
            total_acquired: self.counters.total_acquired.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
        }
    }

    async fn endpoints(&self) -> Vec<EndpointSnapshot> {
        let state = self.state.lock().await;
        state.endpoints.iter().map(|e| e.snapshot()).collect()
    }
}
