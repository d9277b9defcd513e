//! Example demonstrating pooled execution with failover
//!
//! This example shows how to:
//! 1. Configure a named cluster with several store nodes
//! 2. Build a registry of pools and an executor on top of it
//! 3. Run units of work that fail over when a node goes dark
//! 4. Watch the dark node's circuit open, then recover through a probe
//!
//! The store driver here is an in-process fake, so the example runs without
//! a real cluster; swap in a driver implementing `Connector` to talk to one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use caspool::cluster::Endpoint;
use caspool::config::{ClusterConfig, Config, RetryPolicy};
use caspool::exec::Executor;
use caspool::registry::ClusterRegistry;
use caspool::session::{BoxError, Connector, Session, WorkError};
use futures::FutureExt;
use tracing::{info, warn};

/// Shared switchboard of nodes currently unreachable.
#[derive(Default)]
struct Outages {
    down: Mutex<HashSet<String>>,
}

impl Outages {
    fn take_down(&self, node: &str) {
        self.down.lock().unwrap().insert(node.to_string());
    }

    fn bring_up(&self, node: &str) {
        self.down.lock().unwrap().remove(node);
    }

    fn is_down(&self, endpoint: &Endpoint) -> bool {
        self.down.lock().unwrap().contains(&endpoint.to_string())
    }
}

struct FakeSession {
    id: u64,
    endpoint: Endpoint,
    outages: Arc<Outages>,
}

#[async_trait]
impl Session for FakeSession {
    async fn is_alive(&mut self) -> bool {
        !self.outages.is_down(&self.endpoint)
    }

    async fn close(&mut self) {}
}

struct FakeConnector {
    next_id: AtomicU64,
    outages: Arc<Outages>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<FakeSession, BoxError> {
        if self.outages.is_down(endpoint) {
            return Err(format!("connection refused by {endpoint}").into());
        }
        Ok(FakeSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.clone(),
            outages: Arc::clone(&self.outages),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Configure one cluster of three store nodes with fast knobs so the
    // whole walkthrough runs in a few seconds.
    let mut cluster = ClusterConfig::new(vec![
        "cass-1.internal:9160".parse()?,
        "cass-2.internal:9160".parse()?,
        "cass-3.internal:9160".parse()?,
    ]);
    cluster.pool.max_size = 6;
    cluster.pool.min_idle = 2;
    cluster.pool.acquire_timeout_ms = 1_000;
    cluster.retry = RetryPolicy {
        max_attempts: 3,
        backoff_base_ms: 50,
        backoff_cap_ms: 500,
        jitter: false,
    };
    cluster.circuit.failure_threshold = 1;
    cluster.circuit.success_threshold = 1;
    cluster.circuit.cooldown_ms = 2_000;

    let mut clusters = HashMap::new();
    clusters.insert("main".to_string(), cluster);
    let config = Config { clusters };
    config.validate()?;

    // Build the registry and executor on top of the fake driver.
    let outages = Arc::new(Outages::default());
    let connector = Arc::new(FakeConnector {
        next_id: AtomicU64::new(1),
        outages: Arc::clone(&outages),
    });
    let registry = Arc::new(ClusterRegistry::from_config(connector, &config).await?);
    let maintenance = registry.start_maintenance().await;
    let executor = Executor::new(Arc::clone(&registry));

    let pool = registry.lookup("main").await?;
    let warmed = pool.prefill().await;
    info!(warmed, "Warmed up the pool");

    // One node goes dark: connects to it are refused and in-flight work on
    // its sessions dies with a transport error.
    outages.take_down("cass-2.internal:9160");
    warn!("Simulating outage of cass-2.internal:9160");

    for i in 1..=12 {
        let outages = Arc::clone(&outages);
        let result: Result<String, _> = executor
            .execute("main", move |session: &mut FakeSession| {
                let id = session.id;
                let endpoint = session.endpoint.clone();
                let outages = Arc::clone(&outages);
                async move {
                    if outages.is_down(&endpoint) {
                        Err(WorkError::transport(format!("{endpoint} dropped the request")))
                    } else {
                        Ok(format!("row {i} via session {id} on {endpoint}"))
                    }
                }
                .boxed()
            })
            .await;

        match result {
            Ok(row) => info!("Work #{i} succeeded: {row}"),
            Err(e) => warn!("Work #{i} failed: {e}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Print statistics
    println!("\n=== POOL STATISTICS ===\n");
    let stats = pool.stats().await;
    println!("Cluster: {}", stats.cluster);
    println!("  Idle connections: {}", stats.idle);
    println!("  Leased connections: {}", stats.in_use);
    println!("  Total created: {}", stats.total_created);
    println!("  Total reused: {}", stats.total_reused);
    println!("  Total evicted: {}", stats.total_evicted);
    println!("  Acquire timeouts: {}", stats.acquire_timeouts);

    println!("\n=== ENDPOINT HEALTH ===\n");
    for snapshot in pool.endpoints().await {
        println!("  {}", snapshot.endpoint);
        println!("    Circuit: {}", snapshot.circuit_state.name());
        println!("    Connects: {}", snapshot.total_connects);
        println!("    Connect failures: {}", snapshot.connect_failures);
        println!("    Work failures: {}", snapshot.work_failures);
    }

    // Bring the node back and wait out the circuit cooldown, then force a
    // probe connect at it by steering away from the healthy nodes.
    println!("\n=== TESTING NODE RECOVERY ===\n");
    outages.bring_up("cass-2.internal:9160");
    info!("cass-2.internal:9160 is back; waiting for the circuit cooldown");
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let avoid: HashSet<Endpoint> = [
        "cass-1.internal:9160".parse()?,
        "cass-3.internal:9160".parse()?,
    ]
    .into();
    let probe = pool.acquire_avoiding(&avoid).await?;
    info!(endpoint = %probe.endpoint(), "Probe connect succeeded");
    probe.release(true).await;

    println!("\n=== FINAL HEALTH STATUS ===\n");
    for snapshot in pool.endpoints().await {
        println!(
            "  {}: {}",
            snapshot.endpoint,
            snapshot.circuit_state.name()
        );
    }

    for task in maintenance {
        task.abort();
    }
    registry.shutdown().await;
    info!("Registry shut down");

    Ok(())
}
