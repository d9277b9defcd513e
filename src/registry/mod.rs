//! Cluster registry
//!
//! One process talks to any number of named clusters; the registry maps each
//! name to its [`Pool`]. Registration happens at startup and is serialized
//! behind a write lock, lookups afterwards are cheap read-locked clones of
//! the pool handle. Shutting the registry down closes every pool it holds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, Config};
use crate::pool::Pool;
use crate::session::Connector;

/// Errors from cluster registration and lookup
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The name is already taken by a registered cluster
    #[error("Cluster '{0}' is already registered")]
    DuplicateCluster(String),

    /// No cluster registered under the name
    #[error("Unknown cluster '{0}'")]
    UnknownCluster(String),
}

/// Name-to-pool map shared by everything that executes work.
///
/// The registry owns the connector and hands it to every pool it builds, so
/// one driver serves all clusters.
pub struct ClusterRegistry<C: Connector> {
    connector: Arc<C>,
    clusters: RwLock<HashMap<String, Pool<C>>>,
}

impl<C: Connector> ClusterRegistry<C> {
    pub fn new(connector: Arc<C>) -> Self {
        Self {
            connector,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry with every cluster in `config` registered.
    pub async fn from_config(connector: Arc<C>, config: &Config) -> Result<Self, RegistryError> {
        let registry = Self::new(connector);
        for (name, cluster) in &config.clusters {
            registry.register(name.clone(), cluster.clone()).await?;
        }
        Ok(registry)
    }

    /// Register a cluster and build its pool.
    ///
    /// Returns the new pool, or [`RegistryError::DuplicateCluster`] when the
    /// name is taken; the existing pool is left untouched.
    pub async fn register(
        &self,
        name: impl Into<String>,
        config: ClusterConfig,
    ) -> Result<Pool<C>, RegistryError> {
        let name = name.into();
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(&name) {
            warn!(cluster = %name, "Rejected duplicate cluster registration");
            return Err(RegistryError::DuplicateCluster(name));
        }

        let pool = Pool::new(name.clone(), &config, Arc::clone(&self.connector));
        clusters.insert(name.clone(), pool.clone());
        info!(
            cluster = %name,
            endpoints = config.endpoints.len(),
            max_size = pool.max_size(),
            "Registered cluster"
        );
        Ok(pool)
    }

    /// Look up the pool for a registered cluster.
    pub async fn lookup(&self, name: &str) -> Result<Pool<C>, RegistryError> {
        let clusters = self.clusters.read().await;
        clusters
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCluster(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.clusters.read().await.contains_key(name)
    }

    /// Registered cluster names, sorted for stable output.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start the maintenance sweep on every registered pool.
    pub async fn start_maintenance(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let clusters = self.clusters.read().await;
        clusters.values().map(Pool::start_maintenance).collect()
    }

    /// Remove a cluster and close its pool.
    pub async fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        let removed = { self.clusters.write().await.remove(name) };
        match removed {
            Some(pool) => {
                pool.close().await;
                info!(cluster = %name, "Cluster deregistered");
                Ok(())
            }
            None => Err(RegistryError::UnknownCluster(name.to_string())),
        }
    }

    /// Close every pool and empty the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Pool<C>)> = {
            let mut clusters = self.clusters.write().await;
            clusters.drain().collect()
        };
        let count = drained.len();
        for (name, pool) in drained {
            pool.close().await;
            debug!(cluster = %name, "Cluster pool shut down");
        }
        info!(clusters = count, "Registry shut down");
    }
}

impl<C: Connector> std::fmt::Debug for ClusterRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry").finish_non_exhaustive()
    }
}
