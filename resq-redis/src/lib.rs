//! # Resq Redis
//!
//! The storage layer underneath the resq job queue.
//!
//! ## Features
//!
//! - **Store capability**: one async method per command the queue needs
//! - **Connection Pooling**: a bb8-pooled Redis implementation
//! - **Namespacing**: a decorator that prefixes every key (`resque:` by default)
//! - **In-memory backend**: same semantics without a server, for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use resq_redis::{NamespacedStore, RedisConfig, RedisStore, Store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::from_dsn("redis://localhost:6379/0")?;
//!     let namespace = config.namespace.clone();
//!
//!     let store = NamespacedStore::new(RedisStore::new(config).await?, namespace);
//!     store.rpush("queue:default", "{}").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Without a server
//!
//! ```rust
//! use resq_redis::{MemoryStore, Store};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryStore::new();
//! store.rpush("queue:default", "job").await.unwrap();
//! assert_eq!(store.llen("queue:default").await.unwrap(), 1);
//! # }
//! ```

mod config;
mod error;
mod memory;
mod namespace;
mod pool;
mod service;
mod store;

pub use config::{DEFAULT_NAMESPACE, RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use memory::MemoryStore;
pub use namespace::NamespacedStore;
pub use pool::{RedisConnection, RedisPool, RedisPoolBuilder};
pub use service::{PoolStats, RedisStore};
pub use store::Store;

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
///
/// ```
/// use resq_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::error::{RedisError, Result};
    pub use crate::memory::MemoryStore;
    pub use crate::namespace::NamespacedStore;
    pub use crate::service::RedisStore;
    pub use crate::store::Store;
}
