//! Connection handles and leases
//!
//! A [`ConnectionHandle`] owns one session to one endpoint together with its
//! pooling metadata. Handles are owned by the pool and lent out wrapped in a
//! [`Lease`], which returns them on drop so a panicking or early-returning
//! caller can never strand a pool slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use super::PoolInner;
use crate::cluster::{Endpoint, EndpointState};
use crate::session::{Connector, Session};

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Parked in the pool, ready to be leased
    Idle,

    /// Checked out by a caller
    InUse,

    /// Marked unusable; will be closed and destroyed, never reused
    Broken,
}

/// One pooled session plus its bookkeeping
pub struct ConnectionHandle<S> {
    /// Pool-unique handle id
    id: u64,

    /// Endpoint this session is connected to
    endpoint: Arc<EndpointState>,

    /// The driver session
    session: S,

    /// Lifecycle state
    state: HandleState,

    /// When the session was opened
    opened_at: Instant,

    /// Last checkout or unit of work
    last_used_at: Instant,

    /// Last time the session's liveness was confirmed; None forces a probe
    /// on the next checkout
    last_verified_at: Option<Instant>,

    /// Units of work served
    use_count: u64,
}

impl<S: Session> ConnectionHandle<S> {
    pub(crate) fn new(id: u64, endpoint: Arc<EndpointState>, session: S) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            session,
            state: HandleState::Idle,
            opened_at: now,
            last_used_at: now,
            last_verified_at: Some(now),
            use_count: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.endpoint.endpoint()
    }

    pub(crate) fn endpoint_state(&self) -> &Arc<EndpointState> {
        &self.endpoint
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Age of the session since it was opened.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Time since the last checkout or unit of work.
    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Mutable access to the session; counts as a use.
    pub(crate) fn session_mut(&mut self) -> &mut S {
        self.mark_used();
        &mut self.session
    }

    fn mark_used(&mut self) {
        self.last_used_at = Instant::now();
        self.use_count += 1;
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = HandleState::InUse;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = HandleState::Idle;
        self.last_used_at = Instant::now();
    }

    pub(crate) fn mark_broken(&mut self) {
        self.state = HandleState::Broken;
    }

    /// Idle beyond the configured maximum.
    pub(crate) fn is_stale(&self, max_idle: Duration) -> bool {
        self.idle_for() > max_idle
    }

    /// Whether the cached liveness verdict is too old to trust.
    pub(crate) fn needs_verification(&self, interval: Duration) -> bool {
        match self.last_verified_at {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    /// Probe the session and refresh the cached verdict on success.
    pub(crate) async fn verify_alive(&mut self) -> bool {
        let alive = self.session.is_alive().await;
        if alive {
            self.last_verified_at = Some(Instant::now());
        }
        alive
    }

    /// Force a liveness probe on the next checkout.
    pub(crate) fn force_reverify(&mut self) {
        self.last_verified_at = None;
    }

    /// Served enough work to be replaced by a fresh session.
    pub(crate) fn due_for_recycle(&self, limit: Option<u64>) -> bool {
        limit.map_or(false, |n| self.use_count >= n)
    }

    /// Close the underlying session. Consuming the handle makes a second
    /// close unrepresentable.
    pub(crate) async fn close(mut self) {
        self.session.close().await;
    }
}

impl<S> std::fmt::Debug for ConnectionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("endpoint", self.endpoint.endpoint())
            .field("state", &self.state)
            .field("use_count", &self.use_count)
            .finish()
    }
}

/// A checked-out connection.
///
/// Holds the pool capacity permit for the duration of the checkout. Release
/// explicitly with [`Lease::release`] to report connection health; a lease
/// dropped without that returns its handle as healthy but unverified, so the
/// next checkout re-probes liveness before trusting it.
pub struct Lease<C: Connector> {
    pool: Arc<PoolInner<C>>,
    handle: Option<ConnectionHandle<C::Session>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<C: Connector> Lease<C> {
    pub(crate) fn new(
        pool: Arc<PoolInner<C>>,
        handle: ConnectionHandle<C::Session>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            handle: Some(handle),
            permit: Some(permit),
        }
    }

    /// Cluster this lease belongs to.
    pub fn cluster(&self) -> &str {
        self.pool.cluster()
    }

    /// Endpoint the leased session is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        self.handle_ref().endpoint()
    }

    /// Pool-unique id of the underlying handle.
    pub fn id(&self) -> u64 {
        self.handle_ref().id()
    }

    /// Units of work this connection has served.
    pub fn use_count(&self) -> u64 {
        self.handle_ref().use_count()
    }

    /// The leased session. Each call counts as a use.
    pub fn session(&mut self) -> &mut C::Session {
        self.handle_mut().session_mut()
    }

    /// Return the connection to its pool.
    ///
    /// `healthy = false` marks the connection broken: it is closed and never
    /// handed out again, and the endpoint's failure gate records the outcome.
    pub async fn release(mut self, healthy: bool) {
        if let (Some(handle), permit) = (self.handle.take(), self.permit.take()) {
            self.pool.release_handle(handle, permit, healthy, true).await;
        }
    }

    fn handle_ref(&self) -> &ConnectionHandle<C::Session> {
        self.handle.as_ref().expect("lease accessed after release")
    }

    fn handle_mut(&mut self) -> &mut ConnectionHandle<C::Session> {
        self.handle.as_mut().expect("lease accessed after release")
    }
}

/// Returns the handle through a spawned release. With no runtime to spawn
/// on, only the pool accounting is repaired: the session is abandoned
/// without a `close()` and transport teardown falls to the session's own
/// drop.
impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let permit = self.permit.take();
        let pool = Arc::clone(&self.pool);

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    pool.release_handle(handle, permit, true, false).await;
                });
            }
            Err(_) => {
                // No runtime left (process teardown): keep the accounting
                // straight and let the session close with its Drop.
                debug!(
                    cluster = %pool.cluster(),
                    endpoint = %handle.endpoint(),
                    "Lease dropped outside a runtime"
                );
                pool.note_lease_gone(&handle);
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Lease");
        dbg.field("cluster", &self.pool.cluster());
        if let Some(handle) = &self.handle {
            dbg.field("handle", handle);
        }
        dbg.finish()
    }
}
