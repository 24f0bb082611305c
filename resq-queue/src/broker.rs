//! The broker: one handle on the store plus everything layered over it.

use resq_log::info;
use resq_redis::{NamespacedStore, RedisConfig, RedisStore, Store};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::error::QueueResult;
use crate::events::EventBus;
use crate::factory::{JobFactory, JobRegistry};
use crate::failure::{FailureBackend, StoreFailureBackend};
use crate::job::Job;
use crate::queue::{MatchSpec, QueueEngine};
use crate::stat::StatCounter;
use crate::status::StatusTracker;
use crate::worker::Worker;

/// Entry point for producers and workers.
///
/// Cloning is cheap; clones share the store, listeners and handler registry.
///
/// # Examples
///
/// ```
/// use resq_queue::Broker;
/// use resq_redis::MemoryStore;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> resq_queue::QueueResult<()> {
/// let broker = Broker::new(MemoryStore::new());
/// broker.registry().register_fn("SendEmail", |_args| async { Ok(()) });
///
/// let id = broker
///     .enqueue("mail", "SendEmail", Some(json!({"to": "a@b.c"})), true)
///     .await?;
/// assert!(id.is_some());
/// assert_eq!(broker.size("mail").await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn Store>,
    engine: QueueEngine,
    events: EventBus,
    registry: JobRegistry,
    factory: Arc<dyn JobFactory>,
    failures: Arc<dyn FailureBackend>,
    stats: StatCounter,
    config: BrokerConfig,
}

impl Broker {
    /// Broker over `store` with default settings.
    pub fn new<S: Store + 'static>(store: S) -> Self {
        Self::from_store(Arc::new(store))
    }

    /// Broker over a shared store.
    pub fn from_store(store: Arc<dyn Store>) -> Self {
        let registry = JobRegistry::new();
        let config = BrokerConfig::default();
        Self {
            engine: QueueEngine::new(store.clone()),
            events: EventBus::new(),
            factory: Arc::new(registry.clone()),
            registry,
            failures: Arc::new(StoreFailureBackend::new(store.clone())),
            stats: stats_for(&store, &config),
            config,
            store,
        }
    }

    /// Connect to Redis, namespacing every key with `config.namespace`.
    pub async fn connect(config: RedisConfig) -> QueueResult<Self> {
        let namespace = config.namespace.clone();
        let redis = RedisStore::new(config).await?;
        info!("Connected broker with namespace '{}'", namespace);
        Ok(Self::new(NamespacedStore::new(redis, namespace)))
    }

    /// Build handlers with `factory` instead of the built-in registry.
    pub fn with_factory<F: JobFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Send failure records to `backend`.
    pub fn with_failure_backend<B: FailureBackend + 'static>(mut self, backend: B) -> Self {
        self.failures = Arc::new(backend);
        self
    }

    /// Apply `config`.
    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.stats = stats_for(&self.store, &config);
        self.config = config;
        self
    }

    /// Put a job on `queue`. Returns the id, or `None` when a listener
    /// cancelled the enqueue.
    pub async fn enqueue(
        &self,
        queue: &str,
        class: &str,
        args: Option<Value>,
        track: bool,
    ) -> QueueResult<Option<String>> {
        Job::create(self, queue, class, args, track, None).await
    }

    /// Take the next job from `queue`.
    pub async fn reserve(&self, queue: &str) -> QueueResult<Option<Job>> {
        Job::reserve(self, queue).await
    }

    /// Known queue names.
    pub async fn queues(&self) -> QueueResult<Vec<String>> {
        self.engine.queues().await
    }

    /// Number of jobs waiting on `queue`.
    pub async fn size(&self, queue: &str) -> QueueResult<u64> {
        self.engine.size(queue).await
    }

    /// Remove matching jobs from `queue`, or all of them when `specs` is
    /// empty. Returns the number removed.
    pub async fn dequeue(&self, queue: &str, specs: &[MatchSpec]) -> QueueResult<u64> {
        self.engine.dequeue(queue, specs).await
    }

    /// Drop `queue` and its jobs. Returns the number of jobs removed.
    pub async fn remove_queue(&self, queue: &str) -> QueueResult<u64> {
        self.engine.remove_queue(queue).await
    }

    /// Status tracker for job `id`.
    pub fn status(&self, id: &str) -> StatusTracker {
        StatusTracker::new(self.store.clone(), id).with_ttl(self.config.status_ttl)
    }

    /// Every registered worker.
    pub async fn workers(&self) -> QueueResult<Vec<Worker>> {
        Worker::all(self).await
    }

    pub fn stats(&self) -> &StatCounter {
        &self.stats
    }

    pub fn failures(&self) -> Arc<dyn FailureBackend> {
        self.failures.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The built-in handler registry. Unused once [`Broker::with_factory`]
    /// installed another factory.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn factory(&self) -> Arc<dyn JobFactory> {
        self.factory.clone()
    }

    pub fn engine(&self) -> &QueueEngine {
        &self.engine
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

fn stats_for(store: &Arc<dyn Store>, config: &BrokerConfig) -> StatCounter {
    StatCounter::new(store.clone())
        .with_ttl(config.stat_ttl)
        .with_disabled(config.disable_stats)
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("prefix", &self.store.prefix())
            .field("events", &self.events)
            .field("config", &self.config)
            .finish()
    }
}
