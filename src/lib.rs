//! caspool - cluster-aware connection pooling and failover execution for
//! column-store clients

pub mod cluster;
pub mod config;
pub mod exec;
pub mod pool;
pub mod registry;
pub mod session;

pub use config::Config;
pub use exec::Executor;
pub use registry::ClusterRegistry;
pub use session::WorkError;
