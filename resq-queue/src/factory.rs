//! Job handlers and the registry that builds them by class name.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{QueueError, QueueResult};
use crate::job::Job;

/// User code run for a job.
///
/// A fresh handler is built for every job. `set_up` and `tear_down` are
/// optional; `perform` is the job itself. The [`Job`] passed in is the job
/// being run (queue, payload, worker).
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs before `perform`.
    async fn set_up(&mut self, _job: &Job) -> QueueResult<()> {
        Ok(())
    }

    /// Do the work.
    async fn perform(&mut self, job: &Job) -> QueueResult<()>;

    /// Runs after a successful `perform`.
    async fn tear_down(&mut self, _job: &Job) -> QueueResult<()> {
        Ok(())
    }
}

/// Builds handlers from a class name.
pub trait JobFactory: Send + Sync {
    /// Build the handler for `class`.
    ///
    /// Unknown classes yield [`QueueError::HandlerNotFound`]; classes without a
    /// perform step yield [`QueueError::Contract`].
    fn create(&self, class: &str, args: &Value, queue: &str) -> QueueResult<Box<dyn JobHandler>>;
}

/// Boxed future returned by closure-based handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = QueueResult<()>> + Send>>;

/// Closure-based step of a [`JobDefinition`].
pub type StepFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

type Constructor = Arc<dyn Fn(&Value, &str) -> QueueResult<Box<dyn JobHandler>> + Send + Sync>;

/// A handler assembled from optional closures.
///
/// Useful when handlers are described at runtime (plugins, configuration);
/// a definition without a perform step is rejected when a job is built from
/// it.
#[derive(Clone, Default)]
pub struct JobDefinition {
    set_up: Option<StepFn>,
    perform: Option<StepFn>,
    tear_down: Option<StepFn>,
}

fn step<F, Fut>(f: F) -> StepFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    Arc::new(move |args: Value| -> HandlerFuture { Box::pin(f(args)) })
}

impl JobDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_up<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        self.set_up = Some(step(f));
        self
    }

    pub fn perform<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        self.perform = Some(step(f));
        self
    }

    pub fn tear_down<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        self.tear_down = Some(step(f));
        self
    }
}

struct DefinedHandler {
    args: Value,
    set_up: Option<StepFn>,
    perform: StepFn,
    tear_down: Option<StepFn>,
}

#[async_trait]
impl JobHandler for DefinedHandler {
    async fn set_up(&mut self, _job: &Job) -> QueueResult<()> {
        match &self.set_up {
            Some(f) => f(self.args.clone()).await,
            None => Ok(()),
        }
    }

    async fn perform(&mut self, _job: &Job) -> QueueResult<()> {
        (self.perform)(self.args.clone()).await
    }

    async fn tear_down(&mut self, _job: &Job) -> QueueResult<()> {
        match &self.tear_down {
            Some(f) => f(self.args.clone()).await,
            None => Ok(()),
        }
    }
}

/// The default [`JobFactory`]: a map from class name to constructor.
///
/// # Examples
///
/// ```
/// use resq_queue::{Job, JobFactory, JobHandler, JobRegistry, QueueResult};
/// use serde::Deserialize;
/// use serde_json::json;
///
/// #[derive(Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// #[async_trait::async_trait]
/// impl JobHandler for SendEmail {
///     async fn perform(&mut self, _job: &Job) -> QueueResult<()> {
///         assert!(self.to.contains('@'));
///         Ok(())
///     }
/// }
///
/// let registry = JobRegistry::new();
/// registry.register::<SendEmail>("SendEmail");
/// registry.register_fn("Ping", |_args| async { Ok(()) });
///
/// assert!(registry.contains("SendEmail"));
/// assert!(registry.create("SendEmail", &json!({"to": "a@b.c"}), "mail").is_ok());
/// assert!(registry.create("Unknown", &json!({}), "mail").is_err());
/// ```
#[derive(Clone, Default)]
pub struct JobRegistry {
    constructors: Arc<RwLock<HashMap<String, Constructor>>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `H`, built by deserializing the job arguments.
    ///
    /// Absent arguments deserialize from an empty object.
    pub fn register<H>(&self, class: impl Into<String>)
    where
        H: JobHandler + DeserializeOwned + 'static,
    {
        let class = class.into();
        let name = class.clone();
        self.insert(
            class,
            Arc::new(move |args: &Value, _queue: &str| -> QueueResult<Box<dyn JobHandler>> {
                let args = match args {
                    Value::Null => Value::Object(Default::default()),
                    Value::Array(items) if items.is_empty() => Value::Object(Default::default()),
                    other => other.clone(),
                };
                let handler: H = serde_json::from_value(args).map_err(|e| {
                    QueueError::InvalidArguments(format!("{}: {}", name, e))
                })?;
                Ok(Box::new(handler))
            }),
        );
    }

    /// Register a constructor receiving the arguments and queue name.
    pub fn register_with<H, F>(&self, class: impl Into<String>, ctor: F)
    where
        H: JobHandler + 'static,
        F: Fn(&Value, &str) -> QueueResult<H> + Send + Sync + 'static,
    {
        self.insert(
            class.into(),
            Arc::new(move |args: &Value, queue: &str| -> QueueResult<Box<dyn JobHandler>> {
                Ok(Box::new(ctor(args, queue)?))
            }),
        );
    }

    /// Register an async closure as the perform step.
    pub fn register_fn<F, Fut>(&self, class: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        self.register_definition(class, JobDefinition::new().perform(f));
    }

    /// Register a closure-assembled handler.
    pub fn register_definition(&self, class: impl Into<String>, definition: JobDefinition) {
        let class = class.into();
        let name = class.clone();
        self.insert(
            class,
            Arc::new(move |args: &Value, _queue: &str| -> QueueResult<Box<dyn JobHandler>> {
                let perform = definition
                    .perform
                    .clone()
                    .ok_or_else(|| QueueError::Contract(name.clone()))?;
                Ok(Box::new(DefinedHandler {
                    args: args.clone(),
                    set_up: definition.set_up.clone(),
                    perform,
                    tear_down: definition.tear_down.clone(),
                }))
            }),
        );
    }

    /// Remove a class. Returns whether it was registered.
    pub fn unregister(&self, class: &str) -> bool {
        self.constructors.write().remove(class).is_some()
    }

    /// Whether `class` is registered.
    pub fn contains(&self, class: &str) -> bool {
        self.constructors.read().contains_key(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.constructors.read().keys().cloned().collect();
        classes.sort();
        classes
    }

    fn insert(&self, class: String, ctor: Constructor) {
        self.constructors.write().insert(class, ctor);
    }
}

impl JobFactory for JobRegistry {
    fn create(&self, class: &str, args: &Value, queue: &str) -> QueueResult<Box<dyn JobHandler>> {
        let ctor = self
            .constructors
            .read()
            .get(class)
            .cloned()
            .ok_or_else(|| QueueError::HandlerNotFound(class.to_string()))?;
        ctor(args, queue)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Payload;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl JobHandler for Add {
        async fn perform(&mut self, _job: &Job) -> QueueResult<()> {
            match self.a + self.b {
                5 => Ok(()),
                other => Err(QueueError::ExecutionFailed(format!("unexpected sum {}", other))),
            }
        }
    }

    #[derive(Deserialize, Default)]
    struct NoArgs {}

    #[async_trait]
    impl JobHandler for NoArgs {
        async fn perform(&mut self, _job: &Job) -> QueueResult<()> {
            Ok(())
        }
    }

    fn job() -> Job {
        Job::new("jobs", Payload::new("Test", None, "id"))
    }

    #[tokio::test]
    async fn test_register_typed_handler() {
        let registry = JobRegistry::new();
        registry.register::<Add>("Add");

        let mut handler = registry.create("Add", &json!({"a": 2, "b": 3}), "jobs").unwrap();
        handler.perform(&job()).await.unwrap();
    }

    #[test]
    fn test_typed_handler_with_bad_arguments() {
        let registry = JobRegistry::new();
        registry.register::<Add>("Add");

        let err = registry.create("Add", &json!({"a": "x"}), "jobs").err().unwrap();
        assert!(matches!(err, QueueError::InvalidArguments(_)));
    }

    #[test]
    fn test_absent_arguments_build_from_empty_object() {
        let registry = JobRegistry::new();
        registry.register::<NoArgs>("NoArgs");

        assert!(registry.create("NoArgs", &Value::Null, "jobs").is_ok());
        assert!(registry.create("NoArgs", &json!([]), "jobs").is_ok());
    }

    #[test]
    fn test_unknown_class() {
        let registry = JobRegistry::new();
        let err = registry.create("Missing", &json!({}), "jobs").err().unwrap();
        assert!(matches!(err, QueueError::HandlerNotFound(ref c) if c == "Missing"));
    }

    #[test]
    fn test_definition_without_perform_is_contract_error() {
        let registry = JobRegistry::new();
        registry.register_definition("Half", JobDefinition::new().set_up(|_| async { Ok(()) }));

        let err = registry.create("Half", &json!({}), "jobs").err().unwrap();
        assert!(matches!(err, QueueError::Contract(ref c) if c == "Half"));
    }

    #[tokio::test]
    async fn test_definition_runs_all_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let definition = {
            let (a, b, c) = (calls.clone(), calls.clone(), calls.clone());
            JobDefinition::new()
                .set_up(move |_| {
                    let a = a.clone();
                    async move {
                        a.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .perform(move |_| {
                    let b = b.clone();
                    async move {
                        b.fetch_add(10, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .tear_down(move |_| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(100, Ordering::SeqCst);
                        Ok(())
                    }
                })
        };

        let registry = JobRegistry::new();
        registry.register_definition("Steps", definition);

        let job = job();
        let mut handler = registry.create("Steps", &json!({}), "jobs").unwrap();
        handler.set_up(&job).await.unwrap();
        handler.perform(&job).await.unwrap();
        handler.tear_down(&job).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 111);
    }

    #[tokio::test]
    async fn test_register_fn_receives_arguments() {
        let seen = Arc::new(parking_lot::Mutex::new(Value::Null));
        let registry = JobRegistry::new();
        {
            let seen = seen.clone();
            registry.register_fn("Echo", move |args| {
                let seen = seen.clone();
                async move {
                    *seen.lock() = args;
                    Ok(())
                }
            });
        }

        let mut handler = registry.create("Echo", &json!({"n": 1}), "jobs").unwrap();
        handler.perform(&job()).await.unwrap();
        assert_eq!(*seen.lock(), json!({"n": 1}));
    }

    #[test]
    fn test_register_with_sees_queue() {
        let registry = JobRegistry::new();
        registry.register_with("Queued", |_args, queue| {
            assert_eq!(queue, "critical");
            Ok(NoArgs::default())
        });

        assert!(registry.create("Queued", &json!({}), "critical").is_ok());
        assert_eq!(registry.classes(), vec!["Queued"]);
        assert!(registry.unregister("Queued"));
        assert!(!registry.contains("Queued"));
    }
}
