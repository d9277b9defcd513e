use std::env;
use std::fs;
use std::sync::Mutex;
use tempfile::TempDir;

use caspool::cluster::Strategy;

/// Env tests mutate process-wide variables; serialize them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
clusters:
  analytics:
    endpoints:
      - cass-a1.internal:9160
      - cass-a2.internal:9160
      - cass-a3.internal
    pool:
      max_size: 16
      min_idle: 4
      acquire_timeout_ms: 2000
      max_idle_secs: 120
    retry:
      max_attempts: 5
      backoff_base_ms: 100
      backoff_cap_ms: 2000
      jitter: false
    circuit:
      failure_threshold: 3
      cooldown_ms: 10000
    strategy: least_loaded

  logging:
    endpoints:
      - cass-log.internal:9170
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = caspool::config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.clusters.len(), 2);

    let analytics = config.cluster("analytics").unwrap();
    assert_eq!(analytics.endpoints.len(), 3);
    assert_eq!(analytics.endpoints[0].host, "cass-a1.internal");
    assert_eq!(analytics.endpoints[0].port, 9160);
    // Bare hostnames take the default store port.
    assert_eq!(analytics.endpoints[2].port, 9160);

    assert_eq!(analytics.pool.max_size, 16);
    assert_eq!(analytics.pool.min_idle, 4);
    assert_eq!(analytics.pool.acquire_timeout_ms, 2000);
    assert_eq!(analytics.pool.max_idle_secs, 120);

    assert_eq!(analytics.retry.max_attempts, 5);
    assert_eq!(analytics.retry.backoff_base_ms, 100);
    assert_eq!(analytics.retry.backoff_cap_ms, 2000);
    assert!(!analytics.retry.jitter);

    assert_eq!(analytics.circuit.failure_threshold, 3);
    assert_eq!(analytics.circuit.cooldown_ms, 10_000);
    assert_eq!(analytics.strategy, Strategy::LeastLoaded);

    let logging = config.cluster("logging").unwrap();
    assert_eq!(logging.endpoints[0].port, 9170);
}

/// Test default values for everything a minimal cluster omits
#[test]
fn test_default_values() {
    let yaml = r#"
clusters:
  minimal:
    endpoints:
      - cass-1.internal:9160
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = caspool::config::load_from_yaml(&config_path).unwrap();
    let cluster = config.cluster("minimal").unwrap();

    assert_eq!(cluster.pool.max_size, 10);
    assert_eq!(cluster.pool.min_idle, 2);
    assert_eq!(cluster.pool.acquire_timeout_ms, 5_000);
    assert_eq!(cluster.pool.connect_timeout_ms, 3_000);
    assert_eq!(cluster.pool.max_idle_secs, 90);

    assert_eq!(cluster.retry.max_attempts, 3);
    assert_eq!(cluster.retry.backoff_base_ms, 200);
    assert!(cluster.retry.jitter);

    assert_eq!(cluster.circuit.failure_threshold, 5);
    assert_eq!(cluster.circuit.cooldown_ms, 30_000);

    assert_eq!(cluster.strategy, Strategy::RoundRobin);
}

/// Test that validation rejects a cluster with no endpoints
#[test]
fn test_yaml_rejects_cluster_without_endpoints() {
    let yaml = r#"
clusters:
  empty:
    endpoints: []
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let err = caspool::config::load_from_yaml(&config_path).unwrap_err();
    assert!(err.to_string().contains("no endpoints"));
}

/// Test that validation rejects min_idle above max_size
#[test]
fn test_yaml_rejects_min_idle_above_max_size() {
    let yaml = r#"
clusters:
  lopsided:
    endpoints:
      - cass-1.internal:9160
    pool:
      max_size: 2
      min_idle: 5
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let err = caspool::config::load_from_yaml(&config_path).unwrap_err();
    assert!(err.to_string().contains("min_idle"));
}

/// Test loading a single-cluster configuration from environment variables
#[test]
fn test_load_env_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    // Save original env vars
    let orig_endpoints = env::var("CASPOOL_ENDPOINTS").ok();
    let orig_cluster = env::var("CASPOOL_CLUSTER").ok();
    let orig_max_size = env::var("CASPOOL_MAX_SIZE").ok();
    let orig_timeout = env::var("CASPOOL_ACQUIRE_TIMEOUT_MS").ok();
    let orig_attempts = env::var("CASPOOL_MAX_ATTEMPTS").ok();

    // Set test env vars
    env::set_var(
        "CASPOOL_ENDPOINTS",
        "cass-1.internal:9160, cass-2.internal:9160,cass-3.internal",
    );
    env::set_var("CASPOOL_CLUSTER", "metrics");
    env::set_var("CASPOOL_MAX_SIZE", "8");
    env::set_var("CASPOOL_ACQUIRE_TIMEOUT_MS", "1500");
    env::set_var("CASPOOL_MAX_ATTEMPTS", "4");

    let config = caspool::config::load_from_env().unwrap();

    assert_eq!(config.clusters.len(), 1);
    let cluster = config.cluster("metrics").unwrap();
    assert_eq!(cluster.endpoints.len(), 3);
    assert_eq!(cluster.endpoints[0].host, "cass-1.internal");
    assert_eq!(cluster.endpoints[1].host, "cass-2.internal");
    assert_eq!(cluster.endpoints[2].port, 9160);
    assert_eq!(cluster.pool.max_size, 8);
    assert_eq!(cluster.pool.acquire_timeout_ms, 1500);
    assert_eq!(cluster.retry.max_attempts, 4);

    // Restore original env vars
    cleanup_env("CASPOOL_ENDPOINTS", orig_endpoints);
    cleanup_env("CASPOOL_CLUSTER", orig_cluster);
    cleanup_env("CASPOOL_MAX_SIZE", orig_max_size);
    cleanup_env("CASPOOL_ACQUIRE_TIMEOUT_MS", orig_timeout);
    cleanup_env("CASPOOL_MAX_ATTEMPTS", orig_attempts);
}

/// Test environment loading with only the endpoint list set
#[test]
fn test_env_config_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let orig_endpoints = env::var("CASPOOL_ENDPOINTS").ok();
    let orig_cluster = env::var("CASPOOL_CLUSTER").ok();
    let orig_max_size = env::var("CASPOOL_MAX_SIZE").ok();
    let orig_timeout = env::var("CASPOOL_ACQUIRE_TIMEOUT_MS").ok();
    let orig_attempts = env::var("CASPOOL_MAX_ATTEMPTS").ok();

    env::set_var("CASPOOL_ENDPOINTS", "cass-1.internal:9160");
    env::remove_var("CASPOOL_CLUSTER");
    env::remove_var("CASPOOL_MAX_SIZE");
    env::remove_var("CASPOOL_ACQUIRE_TIMEOUT_MS");
    env::remove_var("CASPOOL_MAX_ATTEMPTS");

    let config = caspool::config::load_from_env().unwrap();

    // Unnamed single-cluster setups land under "default" with default knobs.
    let cluster = config.cluster("default").unwrap();
    assert_eq!(cluster.endpoints.len(), 1);
    assert_eq!(cluster.pool.max_size, 10);
    assert_eq!(cluster.pool.acquire_timeout_ms, 5_000);
    assert_eq!(cluster.retry.max_attempts, 3);

    cleanup_env("CASPOOL_ENDPOINTS", orig_endpoints);
    cleanup_env("CASPOOL_CLUSTER", orig_cluster);
    cleanup_env("CASPOOL_MAX_SIZE", orig_max_size);
    cleanup_env("CASPOOL_ACQUIRE_TIMEOUT_MS", orig_timeout);
    cleanup_env("CASPOOL_MAX_ATTEMPTS", orig_attempts);
}

/// Test that environment loading fails without an endpoint list
#[test]
fn test_env_config_requires_endpoints() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let orig_endpoints = env::var("CASPOOL_ENDPOINTS").ok();
    env::remove_var("CASPOOL_ENDPOINTS");

    let err = caspool::config::load_from_env().unwrap_err();
    assert!(err.to_string().contains("CASPOOL_ENDPOINTS"));

    cleanup_env("CASPOOL_ENDPOINTS", orig_endpoints);
}

/// Test that load_config prefers a file path over the environment
#[test]
fn test_load_config_prefers_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let yaml = r#"
clusters:
  from_file:
    endpoints:
      - cass-file.internal:9160
"#;
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let orig_endpoints = env::var("CASPOOL_ENDPOINTS").ok();
    let orig_cluster = env::var("CASPOOL_CLUSTER").ok();
    env::set_var("CASPOOL_ENDPOINTS", "cass-env.internal:9160");
    env::remove_var("CASPOOL_CLUSTER");

    let from_file = caspool::config::load_config(config_path.to_str()).unwrap();
    assert!(from_file.cluster("from_file").is_some());

    let from_env = caspool::config::load_config(None).unwrap();
    assert!(from_env.cluster("default").is_some());
    assert_eq!(
        from_env.cluster("default").unwrap().endpoints[0].host,
        "cass-env.internal"
    );

    cleanup_env("CASPOOL_ENDPOINTS", orig_endpoints);
    cleanup_env("CASPOOL_CLUSTER", orig_cluster);
}

/// Helper function to cleanup environment variables
fn cleanup_env(key: &str, orig_val: Option<String>) {
    match orig_val {
        Some(val) => env::set_var(key, val),
        None => env::remove_var(key),
    }
}
