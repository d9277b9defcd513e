//! Per-endpoint failure gating
//!
//! Every endpoint carries a small circuit with three states:
//! - Closed: normal operation, connects are allowed
//! - Open: the endpoint kept failing, connects are blocked until a cooldown
//! - HalfOpen: cooldown elapsed, a limited number of probe connects decide
//!   whether the endpoint has recovered
//!
//! There is no active prober in this layer (sessions are opaque), so the
//! half-open probes are how a node that went away comes back into rotation.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Configuration for per-endpoint failure gating
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes before the circuit closes again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long an open circuit blocks connects, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Maximum probe connects allowed while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_half_open_max_probes() -> u32 {
    3
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl CircuitConfig {
    /// Cooldown before an open circuit lets probes through.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Circuit states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - connects are allowed
    Closed,

    /// Endpoint has failed - connects are blocked
    Open {
        /// When the circuit may transition to HalfOpen
        retry_at: Instant,

        /// Consecutive failures that opened the circuit
        failure_count: u32,
    },

    /// Testing recovery - limited probe connects allowed
    HalfOpen {
        /// Successful probes so far
        success_count: u32,

        /// Failed probes so far
        failure_count: u32,
    },
}

impl CircuitState {
    /// Human-readable state name for logs and snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }
}

struct CircuitInner {
    state: CircuitState,

    /// Consecutive failure count while Closed
    consecutive_failures: u32,

    /// Number of times this circuit has opened
    open_count: u64,

    /// Instant of the most recent transition into Open
    last_opened: Option<Instant>,
}

/// Failure gate for one endpoint.
///
/// All methods are cheap and lock a private mutex briefly; the guard is never
/// held across await points.
pub struct EndpointCircuit {
    config: CircuitConfig,
    inner: Mutex<CircuitInner>,
}

impl EndpointCircuit {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_count: 0,
                last_opened: None,
            }),
        }
    }

    /// Whether a connect to this endpoint is currently allowed.
    ///
    /// An open circuit whose cooldown has elapsed transitions to HalfOpen
    /// here, so the first caller after the cooldown becomes the probe.
    pub fn allows_connect(&self) -> bool {
        let mut inner = self.lock();
        match &inner.state {
            CircuitState::Closed => true,

            CircuitState::Open { retry_at, .. } => {
                if Instant::now() >= *retry_at {
                    inner.state = CircuitState::HalfOpen {
                        success_count: 0,
                        failure_count: 0,
                    };
                    true
                } else {
                    false
                }
            }

            CircuitState::HalfOpen {
                success_count,
                failure_count,
            } => success_count + failure_count < self.config.half_open_max_probes,
        }
    }

    /// Record a successful connect or healthy release.
    ///
    /// Returns true when this success closed a half-open circuit, so the
    /// caller can log the recovery.
    pub fn record_success(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;

        match inner.state.clone() {
            CircuitState::Closed => false,

            // A success while open is possible when a connect raced the
            // transition; leave the cooldown in place.
            CircuitState::Open { .. } => false,

            CircuitState::HalfOpen {
                success_count,
                failure_count,
            } => {
                let success_count = success_count + 1;
                if success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    true
                } else {
                    inner.state = CircuitState::HalfOpen {
                        success_count,
                        failure_count,
                    };
                    false
                }
            }
        }
    }

    /// Record a connect failure or unhealthy release.
    ///
    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;

        match inner.state.clone() {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    Self::open(&mut inner, &self.config, failures);
                    true
                } else {
                    false
                }
            }

            CircuitState::Open { .. } => false,

            // Any failed probe reopens the circuit for a fresh cooldown.
            CircuitState::HalfOpen { failure_count, .. } => {
                Self::open(&mut inner, &self.config, failure_count + 1);
                true
            }
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> CircuitState {
        self.lock().state.clone()
    }

    /// Instant of the most recent transition into Open, if any.
    ///
    /// Used as a tie-breaker when every endpoint is gated: the circuit that
    /// opened longest ago is probed first.
    pub fn last_opened(&self) -> Option<Instant> {
        self.lock().last_opened
    }

    /// Number of times this circuit has opened.
    pub fn open_count(&self) -> u64 {
        self.lock().open_count
    }

    /// Force the circuit back to Closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
    }

    fn open(inner: &mut CircuitInner, config: &CircuitConfig, failure_count: u32) {
        let now = Instant::now();
        inner.state = CircuitState::Open {
            retry_at: now + config.cooldown(),
            failure_count,
        };
        inner.open_count += 1;
        inner.last_opened = Some(now);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for EndpointCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCircuit")
            .field("state", &self.state())
            .finish()
    }
}
