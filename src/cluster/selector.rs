//! Endpoint selection
//!
//! Decides which endpoint the next connect should target. Round-robin is the
//! default; least-loaded picks the endpoint with the fewest outstanding
//! leases. Selection always runs three passes:
//! 1. available endpoints not in the caller's avoid set (failover prefers
//!    nodes not yet tried in the current call)
//! 2. any available endpoint
//! 3. when every endpoint is gated, the one whose circuit opened longest ago,
//!    so a cluster-wide outage can heal instead of locking out forever

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::endpoint::{Endpoint, EndpointState};

/// Endpoint selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through endpoints in configuration order
    RoundRobin,
    /// Pick the endpoint with the fewest outstanding leases
    LeastLoaded,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

/// Picks endpoints for new connections
pub struct Selector {
    /// Configured strategy
    strategy: Strategy,

    /// Cursor for round-robin selection
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select the endpoint the next connect should target.
    ///
    /// `avoid` holds endpoints already tried in the current execute call;
    /// they lose preference but stay eligible once everything has been tried.
    /// Returns an index into `endpoints`.
    pub fn select(
        &self,
        endpoints: &[Arc<EndpointState>],
        avoid: &HashSet<Endpoint>,
    ) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();

        if let Some(index) = self.scan(endpoints, start, |ep| {
            ep.is_available() && !avoid.contains(ep.endpoint())
        }) {
            return Some(index);
        }

        if let Some(index) = self.scan(endpoints, start, |ep| ep.is_available()) {
            return Some(index);
        }

        self.select_longest_gated(endpoints)
    }

    /// One pass with the configured strategy over endpoints passing `keep`.
    fn scan<F>(&self, endpoints: &[Arc<EndpointState>], start: usize, keep: F) -> Option<usize>
    where
        F: Fn(&EndpointState) -> bool,
    {
        match self.strategy {
            Strategy::RoundRobin => {
                let len = endpoints.len();
                for i in 0..len {
                    let index = (start + i) % len;
                    if keep(&endpoints[index]) {
                        return Some(index);
                    }
                }
                None
            }

            Strategy::LeastLoaded => endpoints
                .iter()
                .enumerate()
                .filter(|(_, ep)| keep(ep))
                .min_by_key(|(_, ep)| ep.active_leases())
                .map(|(index, _)| index),
        }
    }

    /// Fallback when every endpoint is gated: probe the circuit that opened
    /// longest ago. Retired endpoints stay excluded.
    fn select_longest_gated(&self, endpoints: &[Arc<EndpointState>]) -> Option<usize> {
        endpoints
            .iter()
            .enumerate()
            .filter(|(_, ep)| !ep.is_retired())
            .min_by_key(|(_, ep)| ep.circuit().last_opened())
            .map(|(index, _)| index)
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("strategy", &self.strategy)
            .finish()
    }
}
