//! Failover execution engine
//!
//! The [`Executor`] is the piece callers actually touch: hand it a cluster
//! name and a unit of work, and it takes care of leasing a connection,
//! running the work, reporting connection health back to the pool, and
//! retrying transport failures on endpoints that have not been tried yet.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use caspool::cluster::Endpoint;
//! use caspool::config::ClusterConfig;
//! use caspool::exec::Executor;
//! use caspool::registry::ClusterRegistry;
//! use caspool::session::WorkError;
//! use futures::FutureExt;
//!
//! # use caspool::session::{BoxError, Connector, Session};
//! # struct MySession;
//! # #[async_trait::async_trait]
//! # impl Session for MySession {
//! #     async fn is_alive(&mut self) -> bool { true }
//! #     async fn close(&mut self) {}
//! # }
//! # struct MyDriver;
//! # #[async_trait::async_trait]
//! # impl Connector for MyDriver {
//! #     type Session = MySession;
//! #     async fn connect(&self, _: &Endpoint) -> Result<MySession, BoxError> { Ok(MySession) }
//! # }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ClusterRegistry::new(Arc::new(MyDriver)));
//! let endpoints = vec!["cass-1.internal:9160".parse()?, "cass-2.internal:9160".parse()?];
//! registry.register("main", ClusterConfig::new(endpoints)).await?;
//!
//! let executor = Executor::new(registry);
//! let row_count = executor
//!     .execute("main", |session: &mut MySession| {
//!         async move {
//!             // Run driver calls against the leased session here.
//!             Ok::<u64, WorkError>(1)
//!         }
//!         .boxed()
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;

pub use engine::{ExecError, Executor};
