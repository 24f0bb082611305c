// Resq - a Redis-backed distributed job queue for Rust
//
// Producers enqueue named jobs onto named queues; workers reserve them, run
// each in an isolated task and record the outcome with status tracking,
// failure capture and lifecycle hooks.

// Re-export the queue engine
pub use resq_queue::*;

// Re-export member crates
pub use resq_log;
pub use resq_queue;
pub use resq_redis;

// Storage types most applications need
pub use resq_redis::{MemoryStore, NamespacedStore, RedisConfig, RedisError, RedisStore, Store};

/// Everything needed to enqueue and work jobs.
///
/// ```
/// use resq::prelude::*;
///
/// let broker = Broker::new(MemoryStore::new());
/// let config = WorkerConfig::new(["default"]);
/// let _worker = Worker::new(broker, config);
/// ```
pub mod prelude {
    pub use resq_log::{Level, Logger};
    pub use resq_queue::prelude::*;
    pub use resq_redis::{MemoryStore, NamespacedStore, RedisConfig, RedisStore, Store};
}
