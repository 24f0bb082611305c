//! Integration tests for resq-queue

use resq_queue::*;
use resq_redis::{MemoryStore, NamespacedStore, Store};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn broker() -> (Broker, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (Broker::new(store.clone()), store)
}

#[tokio::test]
async fn test_fifo_per_queue() {
    let (broker, _) = broker();
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            broker
                .enqueue("default", "Echo", Some(json!({"n": n})), false)
                .await
                .unwrap()
                .unwrap(),
        );
    }

    let mut reserved = Vec::new();
    while let Some(job) = broker.reserve("default").await.unwrap() {
        reserved.push(job.id().unwrap().to_string());
    }
    assert_eq!(reserved, ids);
}

#[tokio::test]
async fn test_arguments_survive_the_queue() {
    let (broker, _) = broker();
    let args = json!({"int": 123, "list": [1, 2], "nested": {"a": "b"}});
    broker
        .enqueue("jobs", "Echo", Some(args.clone()), false)
        .await
        .unwrap();

    let job = broker.reserve("jobs").await.unwrap().unwrap();
    assert_eq!(job.arguments(), args);
}

#[tokio::test]
async fn test_status_lifecycle() {
    let (broker, _) = broker();
    let id = broker.enqueue("jobs", "Echo", None, true).await.unwrap().unwrap();
    let status = broker.status(&id);

    assert_eq!(status.get().await.unwrap(), Some(Status::Waiting));
    status.update(Status::Running).await.unwrap();
    status.update(Status::Complete).await.unwrap();
    // Terminal states stick
    status.update(Status::Running).await.unwrap();
    assert_eq!(status.get().await.unwrap(), Some(Status::Complete));

    status.stop().await.unwrap();
    assert_eq!(broker.status(&id).get().await.unwrap(), None);
}

#[tokio::test]
async fn test_recreate_while_running() {
    let (broker, _) = broker();
    let id = broker.enqueue("jobs", "Echo", None, true).await.unwrap().unwrap();
    let job = broker.reserve("jobs").await.unwrap().unwrap();
    job.update_status(&broker, Status::Running).await.unwrap();

    let new_id = job.recreate(&broker).await.unwrap().unwrap();
    assert_ne!(new_id, id);
    assert_eq!(broker.status(&new_id).get().await.unwrap(), Some(Status::Waiting));
    assert_eq!(broker.status(&id).get().await.unwrap(), Some(Status::Running));
}

#[tokio::test]
async fn test_dont_create_skips_after_enqueue() {
    let (broker, _) = broker();
    let after = Arc::new(AtomicU32::new(0));
    broker
        .events()
        .listen(Event::BeforeEnqueue, |_| Hook::DontCreate);
    {
        let after = after.clone();
        broker.events().listen(Event::AfterEnqueue, move |_| {
            after.fetch_add(1, Ordering::SeqCst);
            Hook::Continue
        });
    }

    assert!(broker.enqueue("jobs", "Echo", None, true).await.unwrap().is_none());
    assert_eq!(broker.size("jobs").await.unwrap(), 0);
    assert_eq!(after.load(Ordering::SeqCst), 0);

    broker.events().clear_listeners();
    assert!(broker.enqueue("jobs", "Echo", None, false).await.unwrap().is_some());
}

#[tokio::test]
async fn test_filtered_dequeue_mixed_specs() {
    let (broker, _) = broker();
    broker.enqueue("q", "A", Some(json!({"x": 1})), false).await.unwrap();
    let b = broker.enqueue("q", "B", None, false).await.unwrap().unwrap();
    broker.enqueue("q", "C", None, false).await.unwrap();
    broker.enqueue("q", "A", Some(json!({"x": 2})), false).await.unwrap();
    broker.enqueue("q", "B", None, false).await.unwrap();

    let removed = broker
        .dequeue(
            "q",
            &[
                MatchSpec::with_args("A", json!({"x": 1})),
                MatchSpec::with_id("B", b.clone()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let mut left = Vec::new();
    while let Some(job) = broker.reserve("q").await.unwrap() {
        left.push((job.class().to_string(), job.arguments()));
    }
    assert_eq!(
        left,
        vec![
            ("C".to_string(), json!([])),
            ("A".to_string(), json!({"x": 2})),
            ("B".to_string(), json!([])),
        ]
    );
}

#[tokio::test]
async fn test_namespaced_worker_run() {
    let inner = Arc::new(MemoryStore::new());
    let broker = Broker::new(NamespacedStore::new(inner.clone(), "resque"));
    broker.registry().register_fn("Ok", |_| async { Ok(()) });

    let id = broker.enqueue("jobs", "Ok", None, true).await.unwrap().unwrap();
    assert!(inner.exists("resque:queue:jobs").await.unwrap());
    assert!(inner.sismember("resque:queues", "jobs").await.unwrap());
    assert!(inner.exists(&format!("resque:job:{}:status", id)).await.unwrap());

    let config = WorkerConfig::new(["jobs"])
        .with_blocking(true)
        .with_interval(Duration::from_millis(20));
    let mut worker = Worker::new(broker.clone(), config);
    let handle = worker.handle();

    {
        let handle = handle.clone();
        broker.events().listen(Event::AfterPerform, move |_| {
            handle.shutdown();
            Hook::Continue
        });
    }
    worker.work().await.unwrap();

    assert_eq!(broker.status(&id).get().await.unwrap(), Some(Status::Complete));
    assert!(inner.exists("resque:stat:processed").await.unwrap());
}

#[tokio::test]
async fn test_custom_failure_backend() {
    struct Collect(Arc<parking_lot::Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl FailureBackend for Collect {
        async fn record(
            &self,
            payload: &Payload,
            error: &QueueError,
            _worker: &str,
            _queue: &str,
        ) -> QueueResult<()> {
            self.0.lock().push(format!("{}: {}", payload.class, error));
            Ok(())
        }
    }

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let store = Arc::new(MemoryStore::new());
    let broker = Broker::new(store.clone()).with_failure_backend(Collect(seen.clone()));
    broker.enqueue("jobs", "Unknown", None, false).await.unwrap();

    let config = WorkerConfig::new(["jobs"]).with_interval(Duration::ZERO);
    Worker::new(broker.clone(), config).work().await.unwrap();

    assert_eq!(*seen.lock(), vec!["Unknown: Could not find job class Unknown."]);
    assert_eq!(StoreFailureBackend::new(store).count().await.unwrap(), 0);
    assert_eq!(broker.stats().get("failed").await.unwrap(), 1);
}

#[test]
fn test_queue_error_display() {
    let err = QueueError::Contract("Mailer".to_string());
    assert_eq!(
        err.to_string(),
        "Job class Mailer does not contain a perform() method."
    );
    assert_eq!(err.kind(), "ContractError");
}

// Note: These tests require Redis running
// They are disabled by default but can be run with: cargo test -- --ignored

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_enqueue_and_work() {
    let mut config = resq_redis::RedisConfig::from_dsn("localhost:6379").unwrap();
    config.namespace = "resq-test".to_string();
    let broker = Broker::connect(config).await.unwrap();
    broker.registry().register_fn("Ok", |_| async { Ok(()) });
    broker.remove_queue("integration").await.unwrap();

    let id = broker
        .enqueue("integration", "Ok", Some(json!({"to": "test@example.com"})), true)
        .await
        .unwrap()
        .unwrap();

    let config = WorkerConfig::new(["integration"]).with_interval(Duration::ZERO);
    Worker::new(broker.clone(), config).work().await.unwrap();
    assert_eq!(broker.status(&id).get().await.unwrap(), Some(Status::Complete));
}
