//! Integration tests for the connection pool
//!
//! These exercise the pool as a whole under concurrency: the capacity
//! invariant under plain and steered acquires, waiter timeouts,
//! broken-session eviction, the maintenance sweep, endpoint gating with
//! recovery, and the lease drop backstop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use caspool::cluster::{CircuitState, Endpoint};
use caspool::config::ClusterConfig;
use caspool::pool::{Pool, PoolError};
use caspool::session::{BoxError, Connector, Session};

struct TestSession {
    id: u64,
    endpoint: Endpoint,
}

#[async_trait]
impl Session for TestSession {
    async fn is_alive(&mut self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Connector that can refuse individual endpoints and counts connect
/// attempts per endpoint.
#[derive(Default)]
struct TestConnector {
    next_id: AtomicU64,
    refused: StdMutex<HashSet<String>>,
    attempts: StdMutex<HashMap<String, u64>>,
}

impl TestConnector {
    fn refuse(&self, endpoint: &str) {
        self.refused.lock().unwrap().insert(endpoint.to_string());
    }

    fn allow(&self, endpoint: &str) {
        self.refused.lock().unwrap().remove(endpoint);
    }

    fn attempts(&self, endpoint: &str) -> u64 {
        self.attempts
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Session = TestSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TestSession, BoxError> {
        let key = endpoint.to_string();
        *self.attempts.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        if self.refused.lock().unwrap().contains(&key) {
            return Err(format!("connection refused by {key}").into());
        }
        Ok(TestSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.clone(),
        })
    }
}

fn cluster_config(endpoints: &[&str]) -> ClusterConfig {
    let mut config = ClusterConfig::new(endpoints.iter().map(|e| e.parse().unwrap()).collect());
    config.pool.min_idle = 0;
    config.pool.acquire_timeout_ms = 2_000;
    config.pool.liveness_check_secs = 3_600;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_invariant_under_concurrent_load() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160", "node-b:9160"]);
    config.pool.max_size = 4;
    let pool = Pool::new("hammer", &config, connector);

    let mut workers = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..25 {
                let lease = pool.acquire().await.expect("acquire within capacity");
                tokio::time::sleep(Duration::from_micros(200)).await;
                lease.release(true).await;
            }
        }));
    }

    // Sample the pool while the workers churn; the capacity bound must hold
    // at every observation.
    let sampler = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let stats = pool.stats().await;
                assert!(
                    stats.idle + stats.in_use <= stats.max_size,
                    "pool over capacity: {stats:?}"
                );
                tokio::time::sleep(Duration::from_micros(100)).await;
            }
        })
    };

    for worker in workers {
        worker.await.unwrap();
    }
    sampler.await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle <= stats.max_size);
    assert_eq!(stats.total_acquired, 16 * 25);
}

#[tokio::test]
async fn test_timed_out_waiters_leave_no_phantom_slot() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160"]);
    config.pool.max_size = 1;
    config.pool.acquire_timeout_ms = 40;
    let pool = Pool::new("tiny", &config, connector);

    let held = pool.acquire().await.unwrap();

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        waiters.push(tokio::spawn(async move { pool.acquire().await }));
    }
    for waiter in waiters {
        match waiter.await.unwrap() {
            Err(PoolError::Exhausted { in_use, max_size, .. }) => {
                assert_eq!(in_use, 1);
                assert_eq!(max_size, 1);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    let stats = pool.stats().await;
    assert_eq!(stats.acquire_timeouts, 3);
    assert_eq!(stats.idle + stats.in_use, 1);

    // After release the slot is immediately usable again.
    held.release(true).await;
    let lease = pool.acquire().await.unwrap();
    lease.release(true).await;
}

#[tokio::test]
async fn test_broken_sessions_never_leased_again() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160"]);
    config.pool.max_size = 3;
    let pool = Pool::new("churn", &config, connector);

    let mut broken: HashSet<u64> = HashSet::new();
    for i in 0..60 {
        let mut lease = pool.acquire().await.unwrap();
        let id = lease.session().id;
        assert!(
            !broken.contains(&id),
            "session {id} was marked broken earlier and must not come back"
        );
        if i % 3 == 2 {
            broken.insert(id);
            lease.release(false).await;
        } else {
            lease.release(true).await;
        }
    }

    let stats = pool.stats().await;
    assert_eq!(stats.total_evicted as usize, broken.len());
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_sweep_replaces_stale_sessions() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160"]);
    config.pool.min_idle = 2;
    config.pool.max_idle_secs = 0;
    let pool = Pool::new("warm", &config, Arc::clone(&connector));

    assert_eq!(pool.prefill().await, 2);
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Everything parked is now over the idle limit; the sweep closes it and
    // the warm-up opens replacements.
    let evicted = pool.evict_stale().await;
    assert_eq!(evicted, 2);
    assert_eq!(pool.stats().await.idle, 0);

    let reopened = pool.prefill().await;
    assert_eq!(reopened, 2);

    let stats = pool.stats().await;
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.total_created, 4);
    assert_eq!(stats.total_evicted, 2);
}

#[tokio::test]
async fn test_maintenance_task_keeps_pool_warm() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160"]);
    config.pool.min_idle = 1;
    config.pool.max_idle_secs = 0;
    config.pool.sweep_interval_secs = 1;
    let pool = Pool::new("background", &config, Arc::clone(&connector));

    let task = pool.start_maintenance();

    // First tick fires immediately and fills to min_idle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.stats().await.idle, 1);

    // The next tick evicts the now-stale session and opens a fresh one.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let stats = pool.stats().await;
    assert_eq!(stats.idle, 1);
    assert!(stats.total_evicted >= 1);
    assert!(stats.total_created >= 2);

    pool.close().await;
    task.abort();
}

#[tokio::test]
async fn test_gated_endpoint_skipped_then_recovers() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160", "node-b:9160"]);
    config.pool.max_size = 4;
    config.circuit.failure_threshold = 2;
    config.circuit.cooldown_ms = 100;
    config.circuit.success_threshold = 1;
    let pool = Pool::new("gated", &config, Arc::clone(&connector));

    connector.refuse("node-a:9160");

    // Each acquire rotates through node-a (refused) before landing on
    // node-b; two refusals trip node-a's gate.
    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(first.endpoint().to_string(), "node-b:9160");
    assert_eq!(second.endpoint().to_string(), "node-b:9160");
    assert_eq!(connector.attempts("node-a:9160"), 2);

    let snapshot = pool.endpoints().await;
    let gate_a = snapshot
        .iter()
        .find(|s| s.endpoint.to_string() == "node-a:9160")
        .unwrap();
    assert!(matches!(gate_a.circuit_state, CircuitState::Open { .. }));

    // While gated, fresh connects stop targeting node-a entirely.
    let third = pool.acquire().await.unwrap();
    assert_eq!(third.endpoint().to_string(), "node-b:9160");
    assert_eq!(connector.attempts("node-a:9160"), 2);

    first.release(true).await;
    second.release(true).await;
    third.release(true).await;

    // After the cooldown a probe connect goes through and one success
    // closes the gate again.
    connector.allow("node-a:9160");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let avoid: HashSet<Endpoint> = ["node-b:9160".parse().unwrap()].into();
    let probe = pool.acquire_avoiding(&avoid).await.unwrap();
    assert_eq!(probe.endpoint().to_string(), "node-a:9160");
    probe.release(true).await;

    let snapshot = pool.endpoints().await;
    let gate_a = snapshot
        .iter()
        .find(|s| s.endpoint.to_string() == "node-a:9160")
        .unwrap();
    assert!(matches!(gate_a.circuit_state, CircuitState::Closed));
}

#[tokio::test]
async fn test_acquire_avoiding_prefers_fresh_endpoint_over_parked_session() {
    let connector = Arc::new(TestConnector::default());
    let config = cluster_config(&["node-a:9160", "node-b:9160"]);
    let pool = Pool::new("steer", &config, Arc::clone(&connector));

    // Park one session on node-a.
    let lease = pool.acquire().await.unwrap();
    let parked_endpoint = lease.endpoint().clone();
    lease.release(true).await;

    // Avoiding the parked endpoint must connect to the other node instead
    // of reusing the parked session.
    let avoid: HashSet<Endpoint> = [parked_endpoint.clone()].into();
    let lease = pool.acquire_avoiding(&avoid).await.unwrap();
    assert_ne!(lease.endpoint(), &parked_endpoint);
    lease.release(true).await;

    assert_eq!(pool.stats().await.total_created, 2);
}

#[tokio::test]
async fn test_steered_acquire_at_capacity_evicts_parked_session() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160", "node-b:9160"]);
    config.pool.max_size = 1;
    let pool = Pool::new("steer-full", &config, Arc::clone(&connector));

    // Fill the pool with one parked session.
    let lease = pool.acquire().await.unwrap();
    let parked_endpoint = lease.endpoint().clone();
    lease.release(true).await;
    assert_eq!(pool.stats().await.idle, 1);

    // Steering away from the only parked endpoint connects fresh; the
    // parked session gives up its slot instead of the pool growing.
    let avoid: HashSet<Endpoint> = [parked_endpoint.clone()].into();
    let lease = pool.acquire_avoiding(&avoid).await.unwrap();
    assert_ne!(lease.endpoint(), &parked_endpoint);

    let stats = pool.stats().await;
    assert!(
        stats.idle + stats.in_use <= stats.max_size,
        "pool over capacity: {stats:?}"
    );
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.total_created, 2);
    assert_eq!(stats.total_evicted, 1);

    lease.release(true).await;
    assert_eq!(pool.stats().await.idle, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_invariant_under_steered_load() {
    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160", "node-b:9160"]);
    config.pool.max_size = 2;
    let pool = Pool::new("steer-hammer", &config, connector);

    let avoid_a: HashSet<Endpoint> = ["node-a:9160".parse().unwrap()].into();
    let avoid_b: HashSet<Endpoint> = ["node-b:9160".parse().unwrap()].into();

    let mut workers = Vec::new();
    for i in 0..8 {
        let pool = pool.clone();
        let avoid = if i % 2 == 0 {
            avoid_a.clone()
        } else {
            avoid_b.clone()
        };
        workers.push(tokio::spawn(async move {
            for _ in 0..25 {
                match pool.acquire_avoiding(&avoid).await {
                    Ok(lease) => {
                        tokio::time::sleep(Duration::from_micros(200)).await;
                        lease.release(true).await;
                    }
                    Err(PoolError::Exhausted { .. }) => {}
                    Err(other) => panic!("unexpected acquire error: {other}"),
                }
            }
        }));
    }

    // Steering evicts parked sessions to make room; the bound must hold at
    // every observation regardless.
    let sampler = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let stats = pool.stats().await;
                assert!(
                    stats.idle + stats.in_use <= stats.max_size,
                    "pool over capacity: {stats:?}"
                );
                tokio::time::sleep(Duration::from_micros(100)).await;
            }
        })
    };

    for worker in workers {
        worker.await.unwrap();
    }
    sampler.await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle <= stats.max_size);
}

#[test]
fn test_lease_dropped_outside_runtime_repairs_accounting() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let connector = Arc::new(TestConnector::default());
    let mut config = cluster_config(&["node-a:9160"]);
    config.pool.max_size = 1;
    let pool = Pool::new("teardown", &config, connector);

    let lease = runtime.block_on(pool.acquire()).unwrap();

    // Dropped on a thread with no runtime: the backstop cannot spawn a
    // release, so it repairs the counters and abandons the session.
    drop(lease);

    let stats = runtime.block_on(pool.stats());
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 0);
    let snapshot = runtime.block_on(pool.endpoints());
    assert_eq!(snapshot[0].active_leases, 0);

    // The freed slot is immediately reusable.
    let lease = runtime.block_on(pool.acquire()).unwrap();
    runtime.block_on(lease.release(true));
    assert_eq!(runtime.block_on(pool.stats()).total_created, 2);
}
