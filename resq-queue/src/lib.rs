//! Redis-backed job queue and workers.
//!
//! Provides:
//! - 📦 Named queues stored as Redis lists, strictly FIFO
//! - 👷 Workers that run every job in an isolated task
//! - 🪝 Lifecycle events that can observe, skip or cancel jobs
//! - 📊 Opt-in per-job status tracking and processed/failed counters
//! - 💀 Durable failure records
//! - 🧹 In-place filtered removal of queued jobs
//!
//! ## Quick Start - Enqueueing
//!
//! ```
//! use resq_queue::{Broker, Status};
//! use resq_redis::MemoryStore;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> resq_queue::QueueResult<()> {
//! let broker = Broker::new(MemoryStore::new());
//!
//! let id = broker
//!     .enqueue("emails", "SendWelcome", Some(json!({"to": "user@example.com"})), true)
//!     .await?
//!     .expect("no listener cancelled the job");
//!
//! assert_eq!(broker.size("emails").await?, 1);
//! assert_eq!(broker.status(&id).get().await?, Some(Status::Waiting));
//! # Ok(())
//! # }
//! ```
//!
//! ## Handlers
//!
//! ```
//! use resq_queue::{Job, JobHandler, JobRegistry, QueueResult};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct SendWelcome {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendWelcome {
//!     async fn perform(&mut self, job: &Job) -> QueueResult<()> {
//!         println!("{} -> {}", job, self.to);
//!         Ok(())
//!     }
//! }
//!
//! let registry = JobRegistry::new();
//! registry.register::<SendWelcome>("SendWelcome");
//! assert!(registry.contains("SendWelcome"));
//! ```
//!
//! ## Hooks
//!
//! ```
//! use resq_queue::{Broker, Event, EventData, Hook};
//! use resq_redis::MemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> resq_queue::QueueResult<()> {
//! let broker = Broker::new(MemoryStore::new());
//! broker.events().listen(Event::BeforeEnqueue, |data| match data {
//!     EventData::Enqueue(params) if params.queue == "disabled" => Hook::DontCreate,
//!     _ => Hook::Continue,
//! });
//!
//! assert!(broker.enqueue("disabled", "Job", None, false).await?.is_none());
//! assert_eq!(broker.size("disabled").await?, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use resq_queue::*;
//! use resq_redis::RedisConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let broker = Broker::connect(RedisConfig::from_dsn("localhost:6379")?).await?;
//!     broker.registry().register_fn("send_email", |args| async move {
//!         println!("sending {}", args);
//!         Ok(())
//!     });
//!
//!     broker
//!         .enqueue("default", "send_email", Some(serde_json::json!({"to": "user@example.com"})), false)
//!         .await?;
//!
//!     // QUEUE=default INTERVAL=5 BLOCKING=1 ...
//!     let mut worker = Worker::new(broker, WorkerConfig::from_env()?);
//!     worker.work().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod failure;
pub mod job;
pub mod queue;
pub mod stat;
pub mod status;
pub mod worker;

pub use broker::Broker;
pub use config::{BrokerConfig, WorkerConfig};
pub use error::{QueueError, QueueResult};
pub use events::{EnqueueParams, Event, EventBus, EventData, Hook, ListenerId};
pub use factory::{JobDefinition, JobFactory, JobHandler, JobRegistry};
pub use failure::{FailureBackend, FailureRecord, StoreFailureBackend};
pub use job::{Job, Payload, PerformOutcome};
pub use queue::{MatchSpec, QueueEngine};
pub use stat::StatCounter;
pub use status::{Status, StatusRecord, StatusTracker};
pub use worker::{Worker, WorkerHandle, WorkerJob};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::Broker;
    pub use crate::config::{BrokerConfig, WorkerConfig};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::events::{Event, EventData, Hook};
    pub use crate::factory::{JobFactory, JobHandler, JobRegistry};
    pub use crate::job::{Job, Payload, PerformOutcome};
    pub use crate::queue::MatchSpec;
    pub use crate::status::Status;
    pub use crate::worker::{Worker, WorkerHandle};
}
