//! Endpoints and per-endpoint runtime state

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::circuit::{CircuitConfig, CircuitState, EndpointCircuit};

/// Default store port when an endpoint string carries none.
pub const DEFAULT_PORT: u16 = 9160;

/// Error parsing an endpoint from its `host:port` string form
#[derive(Debug, thiserror::Error)]
pub enum EndpointParseError {
    #[error("Endpoint has an empty host: {0:?}")]
    EmptyHost(String),

    #[error("Invalid port in endpoint {0:?}")]
    InvalidPort(String),
}

/// Network address of one store node.
///
/// Written as `host:port` in configuration; a bare `host` gets the default
/// port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    /// Hostname or address of the node
    pub host: String,

    /// Store port on the node
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }

        Ok(Endpoint::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Runtime state for one endpoint of a pool: lease and outcome counters plus
/// the failure gate that decides whether new connects may target it.
#[derive(Debug)]
pub struct EndpointState {
    /// The address this state tracks
    endpoint: Endpoint,

    /// Leases currently checked out against this endpoint
    active_leases: AtomicU32,

    /// Successful connects since pool creation
    total_connects: AtomicU64,

    /// Failed connect attempts
    connect_failures: AtomicU64,

    /// Units of work that failed at the transport level on this endpoint
    work_failures: AtomicU64,

    /// Set when the endpoint is removed from configuration; bars new connects
    retired: AtomicBool,

    /// Connect gating
    circuit: EndpointCircuit,
}

impl EndpointState {
    pub fn new(endpoint: Endpoint, circuit: CircuitConfig) -> Self {
        Self {
            endpoint,
            active_leases: AtomicU32::new(0),
            total_connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            work_failures: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            circuit: EndpointCircuit::new(circuit),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// A lease to this endpoint was handed out.
    pub fn lease_started(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
    }

    /// A lease to this endpoint came back.
    pub fn lease_finished(&self) {
        self.active_leases.fetch_sub(1, Ordering::Relaxed);
    }

    /// Leases currently outstanding against this endpoint.
    pub fn active_leases(&self) -> u32 {
        self.active_leases.load(Ordering::Relaxed)
    }

    /// Record an established connection.
    pub fn record_connect(&self) {
        self.total_connects.fetch_add(1, Ordering::Relaxed);
        self.circuit.record_success();
    }

    /// Record a failed connect attempt.
    ///
    /// Returns true when the failure opened the endpoint's circuit.
    pub fn record_connect_failure(&self) -> bool {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.circuit.record_failure()
    }

    /// Record a unit of work that completed cleanly on this endpoint.
    pub fn record_success(&self) {
        self.circuit.record_success();
    }

    /// Record a transport-level failure observed while using this endpoint.
    ///
    /// Returns true when the failure opened the endpoint's circuit.
    pub fn record_failure(&self) -> bool {
        self.work_failures.fetch_add(1, Ordering::Relaxed);
        self.circuit.record_failure()
    }

    /// Whether new connects may target this endpoint.
    pub fn is_available(&self) -> bool {
        !self.is_retired() && self.circuit.allows_connect()
    }

    /// Bar new connects permanently; existing handles are evicted as they
    /// surface.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Relaxed);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Relaxed)
    }

    pub fn circuit(&self) -> &EndpointCircuit {
        &self.circuit
    }

    /// Point-in-time counters for stats and logs.
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            endpoint: self.endpoint.clone(),
            active_leases: self.active_leases(),
            total_connects: self.total_connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            work_failures: self.work_failures.load(Ordering::Relaxed),
            circuit_state: self.circuit.state(),
            retired: self.is_retired(),
        }
    }
}

/// Point-in-time view of one endpoint's counters
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub endpoint: Endpoint,
    pub active_leases: u32,
    pub total_connects: u64,
    pub connect_failures: u64,
    pub work_failures: u64,
    pub circuit_state: CircuitState,
    pub retired: bool,
}
