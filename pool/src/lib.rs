//! bounded async pool for expensive connection-like resources.
//!
//! # Quick Start
//! ```rust
//! use std::io;
//!
//! use xitca_pool::{ConnectionFactory, HandleRegistry, Pool, error::Error};
//!
//! struct Socket;
//!
//! impl ConnectionFactory for Socket {
//!     type Resource = String;
//!     type Error = io::Error;
//!
//!     async fn create(&self) -> Result<Self::Resource, Self::Error> {
//!         Ok(String::from("connected"))
//!     }
//!
//!     async fn destroy(&self, _: Self::Resource) {}
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Error> {
//!     let registry = HandleRegistry::new();
//!     let pool = Pool::builder(Socket).max_size(4).registry(registry.clone()).build()?;
//!
//!     // lease a resource and give it back.
//!     let lease = pool.acquire().await?;
//!     assert_eq!(lease.as_str(), "connected");
//!     lease.release();
//!
//!     // destroy every resource and wait for their handles to go away.
//!     pool.shutdown().drained().await;
//!     assert_eq!(registry.live_count(), 0);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Components
//! - [HandleRegistry] observes every live resource handle and serves leak diagnostics.
//! - [ConnectionFactory] is implemented by transport layers to produce and tear down resources.
//! - [Pool] hands out exclusive [Lease] and serves queued acquirers in order.
//! - [MultiplexPool] shares one resource between concurrent [StreamLease].
//! - [Shutdown] observes the drain of a pool after it stopped handing out resources.

#![forbid(unsafe_code)]

mod config;
mod factory;
mod multiplex;
mod pool;
mod registry;
mod shutdown;

pub mod error;

pub use self::config::{MultiplexBuilder, PoolBuilder};
pub use self::factory::ConnectionFactory;
pub use self::multiplex::{MultiplexMetrics, MultiplexPool, StreamLease};
pub use self::pool::{Acquire, Lease, Metrics, Pool, ResourceState};
pub use self::registry::{Handle, HandleId, HandleRegistry, RegistrationToken, ScopeId};
pub use self::shutdown::{Shutdown, ShutdownState};
