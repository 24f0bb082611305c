//! Jobs: the serialized payload and the reserved unit of work built from it.

use chrono::Utc;
use resq_log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{QueueError, QueueResult};
use crate::events::{EnqueueParams, Event, EventData, Hook};
use crate::factory::{JobFactory, JobHandler};
use crate::status::Status;

/// What is stored on a queue.
///
/// `args` holds a single element: the argument mapping given at enqueue time,
/// or `null` when none was given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unix time of enqueueing, with sub-second precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_time: Option<f64>,
}

impl Payload {
    /// Payload for `class` stamped with the current time.
    pub fn new(class: impl Into<String>, args: Option<Value>, id: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: vec![args.unwrap_or(Value::Null)],
            id: Some(id.into()),
            queue_time: Some(Utc::now().timestamp_micros() as f64 / 1_000_000.0),
        }
    }
}

/// Result of [`Job::perform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformOutcome {
    /// The handler ran to completion.
    Performed,
    /// A `beforePerform` listener vetoed the run.
    Skipped,
}

/// A job taken off a queue.
pub struct Job {
    /// Queue the job came from
    pub queue: String,
    pub payload: Payload,
    /// Id of the worker running the job
    pub worker: Option<String>,
    instance: Option<Box<dyn JobHandler>>,
    factory: Option<Arc<dyn JobFactory>>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: Payload) -> Self {
        Self {
            queue: queue.into(),
            payload,
            worker: None,
            instance: None,
            factory: None,
        }
    }

    /// Build handlers with `factory` instead of the broker's.
    pub fn with_factory(mut self, factory: Arc<dyn JobFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Replace the factory, dropping any handler already built.
    pub fn set_factory(&mut self, factory: Arc<dyn JobFactory>) {
        self.factory = Some(factory);
        self.instance = None;
    }

    pub fn id(&self) -> Option<&str> {
        self.payload.id.as_deref()
    }

    pub fn class(&self) -> &str {
        &self.payload.class
    }

    /// The argument mapping, or an empty array when none was given.
    pub fn arguments(&self) -> Value {
        match self.payload.args.first() {
            Some(Value::Null) | None => Value::Array(Vec::new()),
            Some(args) => args.clone(),
        }
    }

    /// Put a new job on `queue`. Returns its id, or `None` when a
    /// `beforeEnqueue` listener cancelled it.
    ///
    /// `args` must be a JSON object or array; `null` means no arguments.
    /// With `track` set a WAITING status record is written before the job
    /// becomes visible to workers.
    pub async fn create(
        broker: &Broker,
        queue: &str,
        class: &str,
        args: Option<Value>,
        track: bool,
        id: Option<String>,
    ) -> QueueResult<Option<String>> {
        let args = match args {
            None | Some(Value::Null) => None,
            Some(args @ (Value::Array(_) | Value::Object(_))) => Some(args),
            Some(_) => {
                return Err(QueueError::InvalidArguments(
                    "Supplied args must be an array or object.".to_string(),
                ));
            }
        };

        let id = id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let params = EnqueueParams {
            class: class.to_string(),
            args,
            queue: queue.to_string(),
            id,
        };

        if broker
            .events()
            .trigger(Event::BeforeEnqueue, &EventData::Enqueue(&params))
            == Hook::DontCreate
        {
            debug!("Enqueue of {} on {} cancelled by listener", class, queue);
            return Ok(None);
        }

        let tracker = track.then(|| broker.status(&params.id));
        if let Some(tracker) = &tracker {
            tracker.create().await?;
        }

        let payload = Payload::new(class, params.args.clone(), params.id.clone());
        let pushed = broker.engine().push(queue, &payload).await;
        if !matches!(pushed, Ok(true)) {
            if let Some(tracker) = &tracker {
                tracker.stop().await?;
            }
            pushed?;
            return Err(QueueError::EnqueueFailed(format!(
                "Could not push {} onto {}",
                class, queue
            )));
        }

        broker
            .events()
            .trigger(Event::AfterEnqueue, &EventData::Enqueue(&params));

        Ok(Some(params.id))
    }

    /// Take the next job from `queue`.
    pub async fn reserve(broker: &Broker, queue: &str) -> QueueResult<Option<Job>> {
        Ok(broker
            .engine()
            .pop(queue)
            .await?
            .map(|payload| Job::new(queue, payload)))
    }

    /// Wait up to `timeout` for a job on any of `queues`.
    pub async fn reserve_blocking(
        broker: &Broker,
        queues: &[String],
        timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        Ok(broker
            .engine()
            .blocking_pop(queues, timeout)
            .await?
            .map(|(queue, payload)| Job::new(queue, payload)))
    }

    /// Status record of this job, `None` when untracked.
    pub async fn status(&self, broker: &Broker) -> QueueResult<Option<Status>> {
        match self.id() {
            Some(id) => broker.status(id).get().await,
            None => Ok(None),
        }
    }

    /// Move the status record, if any, to `status`.
    pub async fn update_status(&self, broker: &Broker, status: Status) -> QueueResult<()> {
        match self.id() {
            Some(id) => broker.status(id).update(status).await,
            None => Ok(()),
        }
    }

    /// The handler for this job, built on first use.
    pub fn instance(&mut self, broker: &Broker) -> QueueResult<&mut Box<dyn JobHandler>> {
        let handler = match self.instance.take() {
            Some(handler) => handler,
            None => self.build_handler(broker)?,
        };
        Ok(self.instance.insert(handler))
    }

    fn build_handler(&self, broker: &Broker) -> QueueResult<Box<dyn JobHandler>> {
        let factory = self.factory.clone().unwrap_or_else(|| broker.factory());
        factory.create(&self.payload.class, &self.arguments(), &self.queue)
    }

    /// Run the handler: `set_up`, `perform`, `tear_down`.
    ///
    /// `beforePerform` may veto the run, in which case nothing is executed
    /// and [`PerformOutcome::Skipped`] is returned. Handler errors are
    /// returned untouched; recording them is up to the caller.
    pub async fn perform(&mut self, broker: &Broker) -> QueueResult<PerformOutcome> {
        if broker
            .events()
            .trigger(Event::BeforePerform, &EventData::Job(self))
            == Hook::DontPerform
        {
            debug!("{} skipped by beforePerform listener", self);
            return Ok(PerformOutcome::Skipped);
        }

        let mut handler = match self.instance.take() {
            Some(handler) => handler,
            None => self.build_handler(broker)?,
        };
        let result = run_steps(handler.as_mut(), self).await;
        self.instance = Some(handler);
        result?;

        broker
            .events()
            .trigger(Event::AfterPerform, &EventData::Job(self));
        Ok(PerformOutcome::Performed)
    }

    /// Record a failure of this job.
    ///
    /// Fires `onFailure`, marks the status FAILED, stores a failure record and
    /// bumps the `failed` counters.
    pub async fn fail(&self, broker: &Broker, error: &QueueError) -> QueueResult<()> {
        broker.events().trigger(
            Event::OnFailure,
            &EventData::Failure { error, job: self },
        );

        self.update_status(broker, Status::Failed).await?;

        let worker = self.worker.as_deref().unwrap_or_default();
        broker
            .failures()
            .record(&self.payload, error, worker, &self.queue)
            .await?;

        broker.stats().incr("failed").await?;
        if !worker.is_empty() {
            broker.stats().incr(&format!("failed:{}", worker)).await?;
        }
        Ok(())
    }

    /// Enqueue a copy of this job under a new id on the same queue.
    ///
    /// The copy is tracked when this job is, and goes through the enqueue
    /// listeners like any new job.
    pub async fn recreate(&self, broker: &Broker) -> QueueResult<Option<String>> {
        let track = match self.id() {
            Some(id) => broker.status(id).is_tracking().await?,
            None => false,
        };
        let args = self.payload.args.first().cloned();
        Job::create(broker, &self.queue, &self.payload.class, args, track, None).await
    }
}

async fn run_steps(handler: &mut dyn JobHandler, job: &Job) -> QueueResult<()> {
    handler.set_up(job).await?;
    handler.perform(job).await?;
    handler.tear_down(job).await
}

impl Clone for Job {
    /// Clones share the payload but not the built handler.
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            payload: self.payload.clone(),
            worker: self.worker.clone(),
            instance: None,
            factory: self.factory.clone(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .field("worker", &self.worker)
            .field("instantiated", &self.instance.is_some())
            .finish()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![format!("Job{{{}}}", self.queue)];
        if let Some(id) = self.id().filter(|id| !id.is_empty()) {
            parts.push(format!("ID: {}", id));
        }
        parts.push(self.payload.class.clone());
        if !self.payload.args.is_empty() {
            parts.push(serde_json::to_string(&self.payload.args).unwrap_or_default());
        }
        write!(f, "({})", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::StoreFailureBackend;
    use async_trait::async_trait;
    use resq_redis::{MemoryStore, Store};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn broker() -> (Broker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Broker::new(store.clone()), store)
    }

    struct Counting(Arc<AtomicU32>);

    #[async_trait]
    impl JobHandler for Counting {
        async fn perform(&mut self, _job: &Job) -> QueueResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_display_without_id_or_args() {
        let payload = Payload {
            class: "Send".to_string(),
            args: vec![],
            id: None,
            queue_time: None,
        };
        assert_eq!(Job::new("mail", payload).to_string(), "(Job{mail} | Send)");

        let payload = Payload {
            class: "Send".to_string(),
            args: vec![json!({"to": "a@b.c"})],
            id: Some(String::new()),
            queue_time: None,
        };
        assert_eq!(
            Job::new("mail", payload).to_string(),
            r#"(Job{mail} | Send | [{"to":"a@b.c"}])"#
        );
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = Payload::new("Echo", Some(json!({"n": 1})), "abc");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["class"], "Echo");
        assert_eq!(value["args"], json!([{"n": 1}]));
        assert_eq!(value["id"], "abc");
        assert!(value["queue_time"].as_f64().unwrap() > 0.0);

        let decoded: Payload = serde_json::from_str(r#"{"class":"Echo","args":[null]}"#).unwrap();
        assert!(decoded.id.is_none());
        assert!(decoded.queue_time.is_none());
    }

    #[test]
    fn test_display_and_arguments() {
        let job = Job::new("mail", Payload::new("Send", None, "42"));
        assert_eq!(job.to_string(), "(Job{mail} | ID: 42 | Send | [null])");
        assert_eq!(job.arguments(), json!([]));

        let job = Job::new("mail", Payload::new("Send", Some(json!({"to": "x"})), "42"));
        assert_eq!(job.arguments(), json!({"to": "x"}));
    }

    #[tokio::test]
    async fn test_create_pushes_payload() {
        let (broker, _) = broker();
        let id = Job::create(&broker, "jobs", "Echo", Some(json!({"a": 1})), false, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.len(), 32);

        let job = Job::reserve(&broker, "jobs").await.unwrap().unwrap();
        assert_eq!(job.id(), Some(id.as_str()));
        assert_eq!(job.class(), "Echo");
        assert_eq!(job.queue, "jobs");
        assert_eq!(job.arguments(), json!({"a": 1}));
        assert!(job.status(&broker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_scalar_args() {
        let (broker, store) = broker();
        let err = Job::create(&broker, "jobs", "Echo", Some(json!(5)), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArguments(_)));
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_create_with_tracking() {
        let (broker, _) = broker();
        let id = Job::create(&broker, "jobs", "Echo", None, true, Some("fixed".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "fixed");
        assert_eq!(
            broker.status(&id).get().await.unwrap(),
            Some(Status::Waiting)
        );
    }

    #[tokio::test]
    async fn test_before_enqueue_can_cancel() {
        let (broker, _) = broker();
        broker.events().listen(Event::BeforeEnqueue, |data| match data {
            EventData::Enqueue(params) if params.class == "Blocked" => Hook::DontCreate,
            _ => Hook::Continue,
        });

        let created = Job::create(&broker, "jobs", "Blocked", None, true, None)
            .await
            .unwrap();
        assert!(created.is_none());
        assert_eq!(broker.size("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dont_perform_does_not_stop_enqueue() {
        let (broker, _) = broker();
        let seen = Arc::new(AtomicU32::new(0));
        broker
            .events()
            .listen(Event::BeforeEnqueue, |_| Hook::DontPerform);
        {
            let seen = seen.clone();
            broker.events().listen(Event::BeforeEnqueue, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Hook::Continue
            });
        }

        let created = Job::create(&broker, "jobs", "Echo", None, false, None)
            .await
            .unwrap();
        assert!(created.is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(broker.size("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_perform_runs_handler() {
        let (broker, _) = broker();
        let count = Arc::new(AtomicU32::new(0));
        {
            let count = count.clone();
            broker
                .registry()
                .register_with("Count", move |_, _| Ok(Counting(count.clone())));
        }

        let mut job = Job::new("jobs", Payload::new("Count", None, "1"));
        assert_eq!(job.perform(&broker).await.unwrap(), PerformOutcome::Performed);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The built handler is reused
        job.perform(&broker).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_perform_vetoed() {
        let (broker, _) = broker();
        let count = Arc::new(AtomicU32::new(0));
        {
            let count = count.clone();
            broker
                .registry()
                .register_with("Count", move |_, _| Ok(Counting(count.clone())));
        }
        broker
            .events()
            .listen(Event::BeforePerform, |_| Hook::DontPerform);

        let mut job = Job::new("jobs", Payload::new("Count", None, "1"));
        assert_eq!(job.perform(&broker).await.unwrap(), PerformOutcome::Skipped);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_perform_unknown_class() {
        let (broker, _) = broker();
        let mut job = Job::new("jobs", Payload::new("Nope", None, "1"));
        let err = job.perform(&broker).await.unwrap_err();
        assert_eq!(err.to_string(), "Could not find job class Nope.");
    }

    #[tokio::test]
    async fn test_custom_factory_on_job() {
        let (broker, _) = broker();
        let registry = crate::factory::JobRegistry::new();
        registry.register_fn("Local", |_| async { Ok(()) });

        let mut job =
            Job::new("jobs", Payload::new("Local", None, "1")).with_factory(Arc::new(registry));
        assert_eq!(job.perform(&broker).await.unwrap(), PerformOutcome::Performed);
    }

    #[tokio::test]
    async fn test_fail_records_everything() {
        let (broker, store) = broker();
        let id = Job::create(&broker, "jobs", "Echo", None, true, None)
            .await
            .unwrap()
            .unwrap();
        let mut job = Job::reserve(&broker, "jobs").await.unwrap().unwrap();
        job.worker = Some("host:1:jobs".to_string());

        let failures = Arc::new(AtomicU32::new(0));
        {
            let failures = failures.clone();
            broker.events().listen(Event::OnFailure, move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
                Hook::Continue
            });
        }

        job.fail(&broker, &QueueError::ExecutionFailed("boom".into()))
            .await
            .unwrap();

        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(broker.status(&id).get().await.unwrap(), Some(Status::Failed));
        assert_eq!(broker.stats().get("failed").await.unwrap(), 1);
        assert_eq!(broker.stats().get("failed:host:1:jobs").await.unwrap(), 1);

        let records = StoreFailureBackend::new(store).all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].queue, "jobs");
        assert_eq!(records[0].worker, "host:1:jobs");
    }

    #[tokio::test]
    async fn test_recreate_keeps_tracking() {
        let (broker, store) = broker();
        let id = Job::create(&broker, "jobs", "Echo", Some(json!({"x": 1})), true, None)
            .await
            .unwrap()
            .unwrap();
        let job = Job::reserve(&broker, "jobs").await.unwrap().unwrap();

        let new_id = job.recreate(&broker).await.unwrap().unwrap();
        assert_ne!(new_id, id);
        assert_eq!(
            broker.status(&new_id).get().await.unwrap(),
            Some(Status::Waiting)
        );

        let copy = Job::reserve(&broker, "jobs").await.unwrap().unwrap();
        assert_eq!(copy.arguments(), json!({"x": 1}));
        assert!(store.exists(&format!("job:{}:status", new_id)).await.unwrap());
    }
}
