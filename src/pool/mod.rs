//! A generic, bounded, async resource pool.
//!
//! The pool is used to share broker connections between RPC clients and servers, but it is
//! not tied to any transport: anything a [`Manager`] knows how to create and destroy can be
//! pooled.
//!
//! It provides three key guarantees:
//! - no more than `max` resources are ever alive at once;
//! - callers waiting for a resource are served in the order they asked;
//! - every resource the pool creates is destroyed exactly once.
//!
//! ```rust
//! use carrot_rpc::pool::{PoolConfig, ResourcePool};
//! use carrot_rpc::transport::memory::InMemoryBroker;
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::new();
//!     let pool = ResourcePool::builder(broker)
//!         .config(PoolConfig {
//!             max: 4,
//!             ..Default::default()
//!         })
//!         .build()?;
//!
//!     // The connection goes back to the pool when dropped.
//!     let connection = pool.get().await?;
//!     drop(connection);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod manager;
mod resource_pool;

pub use config::{PoolConfig, PoolSettings};
pub use error::PoolError;
pub use manager::Manager;
pub use resource_pool::{Object, PoolBuilder, PoolStatus, ResourcePool};
