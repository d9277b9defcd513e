//! Store driver seam
//!
//! The pool never speaks the store's wire protocol itself. A driver layer
//! supplies sessions through these traits:
//! - [`Session`]: one live transport session to a store node
//! - [`Connector`]: opens sessions to endpoints
//!
//! Units of work run against a borrowed session and classify their own
//! failures through [`WorkError`], which decides retry disposition: transport
//! failures are retried on another node, application rejections are not.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::cluster::Endpoint;

/// Boxed error type used at the driver boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a unit of work, borrowing the session it runs against.
pub type WorkFuture<'s, T> = BoxFuture<'s, Result<T, WorkError>>;

/// One live session to a store endpoint.
///
/// The pool treats the session as opaque: it only probes liveness and closes
/// it. Everything request-specific (writes, reads, consistency) belongs to
/// the driver and to the caller's unit of work.
#[async_trait]
pub trait Session: Send + 'static {
    /// Cheap liveness probe on the underlying transport.
    ///
    /// Called lazily when a pooled session has not been verified recently,
    /// never on the hot path of every checkout.
    async fn is_alive(&mut self) -> bool;

    /// Close the underlying transport. Idempotent.
    async fn close(&mut self);
}

/// Opens sessions to store endpoints.
///
/// One connector instance serves every cluster in a registry; the endpoint
/// argument carries the target node.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: Session;

    /// Establish a new session to `endpoint`.
    ///
    /// Network and authentication failures both surface here; the pool wraps
    /// them as connect failures and feeds the endpoint's failure gate.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Session, BoxError>;
}

/// Failure classification for a unit of work.
///
/// The caller decides the class; the execution engine decides the
/// consequence. A transport failure marks the borrowed connection broken and
/// is retried against another endpoint. An application rejection leaves the
/// connection healthy and is surfaced immediately, because retrying a request
/// the store rejected cannot succeed.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Transport failure: {0}")]
    Transport(#[source] BoxError),

    #[error("Request rejected by store: {0}")]
    Application(#[source] BoxError),
}

impl WorkError {
    /// Wrap a driver error as a transport-classified failure.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        WorkError::Transport(err.into())
    }

    /// Wrap a driver error as an application-classified failure.
    pub fn application(err: impl Into<BoxError>) -> Self {
        WorkError::Application(err.into())
    }

    /// True for failures that the engine may retry on another endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkError::Transport(_))
    }
}
