//! Cluster topology: endpoints, failure gating and selection
//!
//! A cluster is a named, ordered set of store endpoints presenting one
//! logical store. This module tracks each endpoint's runtime state and
//! decides which endpoint the next connection should target.
//!
//! # Components
//!
//! - [`Endpoint`]: address of one store node, written `host:port`
//! - [`EndpointState`]: lease counters and failure gate for one endpoint
//! - [`EndpointCircuit`]: closed/open/half-open connect gating
//! - [`Selector`]: round-robin or least-loaded endpoint selection with
//!   untried-endpoint preference for failover
//!
//! # Failure gating
//!
//! There is no background prober: sessions are opaque, so the only signals
//! are connect outcomes and how borrowed connections come back. Consecutive
//! failures open an endpoint's circuit and take it out of rotation for a
//! cooldown; half-open probes bring it back.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use caspool::cluster::{CircuitConfig, Endpoint, EndpointState, Selector, Strategy};
//!
//! let endpoints: Vec<Arc<EndpointState>> = ["cass-1:9160", "cass-2:9160"]
//!     .iter()
//!     .map(|s| {
//!         let ep: Endpoint = s.parse().unwrap();
//!         Arc::new(EndpointState::new(ep, CircuitConfig::default()))
//!     })
//!     .collect();
//!
//! let selector = Selector::new(Strategy::RoundRobin);
//! let first = selector.select(&endpoints, &HashSet::new()).unwrap();
//! let second = selector.select(&endpoints, &HashSet::new()).unwrap();
//! assert_ne!(first, second);
//! ```

pub mod circuit;
pub mod endpoint;
pub mod selector;

pub use circuit::{CircuitConfig, CircuitState, EndpointCircuit};
pub use endpoint::{Endpoint, EndpointParseError, EndpointSnapshot, EndpointState, DEFAULT_PORT};
pub use selector::{Selector, Strategy};
