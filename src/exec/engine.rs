//! Retry loop around pooled execution

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cluster::Endpoint;
use crate::config::RetryPolicy;
use crate::pool::{Pool, PoolError};
use crate::registry::{ClusterRegistry, RegistryError};
use crate::session::{BoxError, Connector, WorkError, WorkFuture};

/// Terminal outcomes of an execute call
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The cluster name did not resolve
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The pool failed in a way retrying cannot fix: exhausted, closed, or
    /// out of endpoints
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The store rejected the request; the connection is fine and the
    /// request is never retried
    #[error("Request rejected by store: {source}")]
    Application {
        #[source]
        source: BoxError,
    },

    /// The single configured attempt failed
    #[error("Execution failed: {source}")]
    ExecutionFailed {
        #[source]
        source: BoxError,
    },

    /// Every configured attempt failed; carries the last failure
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },
}

/// Runs units of work against registered clusters with failover.
///
/// Cheap to clone; clones share the registry.
pub struct Executor<C: Connector> {
    registry: Arc<ClusterRegistry<C>>,
}

impl<C: Connector> Clone for Executor<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Executor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl<C: Connector> Executor<C> {
    pub fn new(registry: Arc<ClusterRegistry<C>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ClusterRegistry<C> {
        &self.registry
    }

    /// Run `work` against `cluster` using the cluster's configured retry
    /// policy.
    ///
    /// The work closure borrows a leased session and classifies its own
    /// failures: a [`WorkError::Transport`] marks the connection broken and
    /// is retried on an endpoint not yet tried this call, a
    /// [`WorkError::Application`] releases the connection healthy and is
    /// surfaced immediately. The lease is returned to the pool on every exit
    /// path, including panics unwinding through the caller.
    pub async fn execute<T, F>(&self, cluster: &str, work: F) -> Result<T, ExecError>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut C::Session) -> WorkFuture<'s, T> + Send,
    {
        let pool = self.registry.lookup(cluster).await?;
        let policy = pool.retry_policy().clone();
        self.run(pool, policy, work).await
    }

    /// Run `work` against `cluster` under a caller-supplied retry policy.
    pub async fn execute_with_policy<T, F>(
        &self,
        cluster: &str,
        policy: &RetryPolicy,
        work: F,
    ) -> Result<T, ExecError>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut C::Session) -> WorkFuture<'s, T> + Send,
    {
        let pool = self.registry.lookup(cluster).await?;
        self.run(pool, policy.clone(), work).await
    }

    async fn run<T, F>(&self, pool: Pool<C>, policy: RetryPolicy, mut work: F) -> Result<T, ExecError>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut C::Session) -> WorkFuture<'s, T> + Send,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut tried: HashSet<Endpoint> = HashSet::new();
        let mut last_cause: Option<BoxError> = None;

        for attempt in 1..=max_attempts {
            let mut lease = match pool.acquire_avoiding(&tried).await {
                Ok(lease) => lease,
                Err(PoolError::ConnectFailed { endpoint, source }) => {
                    // A refused connect burns the attempt like a transport
                    // failure would; the next attempt steers elsewhere.
                    warn!(
                        cluster = %pool.name(),
                        endpoint = %endpoint,
                        attempt,
                        error = %source,
                        "Connect failed during execute"
                    );
                    tried.insert(endpoint);
                    last_cause = Some(source);
                    if attempt < max_attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                    continue;
                }
                Err(other) => return Err(other.into()),
            };

            let endpoint = lease.endpoint().clone();
            tried.insert(endpoint.clone());
            debug!(
                cluster = %pool.name(),
                endpoint = %endpoint,
                attempt,
                "Executing unit of work"
            );

            let outcome = work(lease.session()).await;
            match outcome {
                Ok(value) => {
                    lease.release(true).await;
                    if attempt > 1 {
                        info!(
                            cluster = %pool.name(),
                            endpoint = %endpoint,
                            attempt,
                            "Work succeeded after failover"
                        );
                    }
                    return Ok(value);
                }
                Err(WorkError::Application(source)) => {
                    lease.release(true).await;
                    debug!(
                        cluster = %pool.name(),
                        endpoint = %endpoint,
                        "Store rejected request; not retrying"
                    );
                    return Err(ExecError::Application { source });
                }
                Err(WorkError::Transport(source)) => {
                    lease.release(false).await;
                    warn!(
                        cluster = %pool.name(),
                        endpoint = %endpoint,
                        attempt,
                        error = %source,
                        "Transport failure during work"
                    );
                    last_cause = Some(source);
                    if attempt < max_attempts {
                        let delay = policy.delay_for(attempt);
                        debug!(
                            cluster = %pool.name(),
                            attempt,
                            delay = ?delay,
                            "Backing off before retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let source = last_cause.unwrap_or_else(|| "no failure recorded".into());
        if max_attempts == 1 {
            Err(ExecError::ExecutionFailed { source })
        } else {
            Err(ExecError::RetriesExhausted {
                attempts: max_attempts,
                source,
            })
        }
    }
}
