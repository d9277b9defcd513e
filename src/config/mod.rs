use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::cluster::{CircuitConfig, Endpoint, Strategy};
use crate::pool::PoolConfig;

/// Floor applied to jittered backoff delays, in milliseconds.
const MIN_BACKOFF_MS: u64 = 50;

/// Retry and failover policy for one cluster.
///
/// Pure data: the execution engine reads it, nothing in it is hard-coded
/// control flow, and callers may override it per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per execute call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds, doubled each attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on the backoff delay in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Spread each delay by up to ±25% to avoid retry stampedes
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_cap_ms() -> u64 {
    5_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows `attempt` (1-based).
    ///
    /// Exponential: `base * 2^(attempt-1)`, capped. With jitter enabled the
    /// delay spreads ±25% and never drops below 50ms.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_cap_ms);

        if !self.jitter {
            return Duration::from_millis(base);
        }

        let spread = base / 4;
        let jittered = if spread == 0 {
            base
        } else {
            base - spread + rand::thread_rng().gen_range(0..=spread * 2)
        };

        Duration::from_millis(jittered.max(MIN_BACKOFF_MS))
    }
}

/// Everything needed to build the pool for one named cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Ordered list of store endpoints, written `host:port`
    pub endpoints: Vec<Endpoint>,

    /// Pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,

    /// Retry and failover policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-endpoint failure gating
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Endpoint selection strategy
    #[serde(default)]
    pub strategy: Strategy,
}

impl ClusterConfig {
    /// Config with default knobs for the given endpoints.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            strategy: Strategy::default(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named clusters, each with its own endpoints and policies
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self {
            clusters: HashMap::new(),
        }
    }

    /// Get a cluster's configuration by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.get(name)
    }

    /// Reject configurations the pool layer cannot honor.
    pub fn validate(&self) -> Result<()> {
        for (name, cluster) in &self.clusters {
            if cluster.endpoints.is_empty() {
                anyhow::bail!("Cluster '{}' has no endpoints", name);
            }
            if cluster.pool.max_size == 0 {
                anyhow::bail!("Cluster '{}' has max_size 0", name);
            }
            if cluster.pool.min_idle > cluster.pool.max_size {
                anyhow::bail!(
                    "Cluster '{}' has min_idle {} above max_size {}",
                    name,
                    cluster.pool.min_idle,
                    cluster.pool.max_size
                );
            }
            if cluster.retry.max_attempts == 0 {
                anyhow::bail!("Cluster '{}' has max_attempts 0", name);
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load a single-cluster configuration from environment variables
///
/// - CASPOOL_ENDPOINTS (comma-separated `host:port` list, required)
/// - CASPOOL_CLUSTER (cluster name, defaults to "default")
/// - CASPOOL_MAX_SIZE (optional)
/// - CASPOOL_ACQUIRE_TIMEOUT_MS (optional)
/// - CASPOOL_MAX_ATTEMPTS (optional)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let endpoints_str = std::env::var("CASPOOL_ENDPOINTS")
        .context("CASPOOL_ENDPOINTS environment variable not set")?;

    let endpoints: Vec<Endpoint> = endpoints_str
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .collect::<Result<_, _>>()
        .context("CASPOOL_ENDPOINTS contains an invalid endpoint")?;

    if endpoints.is_empty() {
        anyhow::bail!("CASPOOL_ENDPOINTS contains no endpoints");
    }

    let name = std::env::var("CASPOOL_CLUSTER").unwrap_or_else(|_| "default".to_string());

    let mut cluster = ClusterConfig::new(endpoints);

    if let Ok(max_size) = std::env::var("CASPOOL_MAX_SIZE") {
        if let Ok(val) = max_size.parse() {
            cluster.pool.max_size = val;
        }
    }

    if let Ok(timeout) = std::env::var("CASPOOL_ACQUIRE_TIMEOUT_MS") {
        if let Ok(val) = timeout.parse() {
            cluster.pool.acquire_timeout_ms = val;
        }
    }

    if let Ok(attempts) = std::env::var("CASPOOL_MAX_ATTEMPTS") {
        if let Ok(val) = attempts.parse() {
            cluster.retry.max_attempts = val;
        }
    }

    let mut config = Config::new();
    config.clusters.insert(name, cluster);
    config.validate()?;
    Ok(config)
}

/// Load configuration from file or environment
///
/// Convenience for bootstrap code: loads the YAML file when a path is given,
/// otherwise falls back to environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}
