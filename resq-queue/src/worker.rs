//! Worker: reserves jobs and runs each one in its own task.

use chrono::Local;
use parking_lot::Mutex;
use resq_log::Logger;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;

use crate::broker::Broker;
use crate::config::{WILDCARD_QUEUE, WorkerConfig};
use crate::error::{QueueError, QueueResult};
use crate::events::{Event, EventData};
use crate::failure::RECORD_DATE_FORMAT;
use crate::job::{Job, Payload};
use crate::status::Status;

/// Set of registered worker ids.
pub const WORKERS_KEY: &str = "workers";

/// What a worker is busy with, stored under `worker:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub queue: String,
    pub run_at: String,
    pub payload: Payload,
}

#[derive(Default)]
struct WorkerState {
    shutdown: AtomicBool,
    paused: AtomicBool,
    wake: Notify,
    // Label and abort handle of the running job task
    child: Mutex<Option<(String, AbortHandle)>>,
}

/// Remote control for a running worker.
///
/// Obtained from [`Worker::handle`] before calling [`Worker::work`]; every
/// method takes effect while the worker is running.
#[derive(Clone)]
pub struct WorkerHandle {
    state: Arc<WorkerState>,
    logger: Logger,
}

impl WorkerHandle {
    /// Stop picking up new jobs. The current job, if any, keeps running.
    pub fn pause_processing(&self) {
        self.logger.notice("USR2 received; pausing job processing", &[]);
        self.state.paused.store(true, Ordering::SeqCst);
        self.state.wake.notify_waiters();
    }

    /// Resume picking up jobs.
    pub fn unpause_processing(&self) {
        self.logger.notice("CONT received; resuming job processing", &[]);
        self.state.paused.store(false, Ordering::SeqCst);
        self.state.wake.notify_waiters();
    }

    /// Exit once the current job is done.
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.logger.notice("Shutting down", &[]);
        self.state.wake.notify_waiters();
    }

    /// Exit now, killing the current job.
    pub fn shutdown_now(&self) {
        self.shutdown();
        self.kill_child();
    }

    /// Kill the current job. The worker keeps running.
    pub fn kill_child(&self) {
        match self.state.child.lock().take() {
            Some((child, task)) => {
                self.logger.info("Killing child at {child}", &[("child", &child)]);
                task.abort();
            }
            None => self.logger.info("No child to kill.", &[]),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("paused", &self.is_paused())
            .field("shutdown", &self.is_shutting_down())
            .finish()
    }
}

/// Processes jobs from a list of queues.
///
/// The id is `hostname:pid:queue1,queue2`. Every job runs in a spawned task:
/// a job that panics or exceeds the configured timeout is recorded as a
/// dirty exit. A job killed through [`WorkerHandle::kill_child`] is abandoned
/// and failed as a dirty exit once the worker moves on or unregisters.
///
/// # Examples
///
/// ```
/// use resq_queue::{Broker, Worker, WorkerConfig};
/// use resq_redis::MemoryStore;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> resq_queue::QueueResult<()> {
/// let broker = Broker::new(MemoryStore::new());
/// broker.registry().register_fn("Ping", |_args| async { Ok(()) });
/// broker.enqueue("default", "Ping", None, false).await?;
///
/// // A zero interval makes a single pass over the queues
/// let config = WorkerConfig::new(["default"]).with_interval(Duration::ZERO);
/// let mut worker = Worker::new(broker.clone(), config);
/// worker.work().await?;
///
/// assert_eq!(broker.stats().get("processed").await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    id: String,
    hostname: String,
    pid: u32,
    queues: Vec<String>,
    config: WorkerConfig,
    broker: Broker,
    logger: Logger,
    state: Arc<WorkerState>,
    current: Option<Job>,
    signal_tasks: Vec<AbortHandle>,
}

impl Worker {
    /// Worker for this process.
    pub fn new(broker: Broker, config: WorkerConfig) -> Self {
        let hostname = local_hostname();
        let pid = std::process::id();
        let id = format!("{}:{}:{}", hostname, pid, config.queues.join(","));
        let logger = Logger::new(config.log_level).with_target("resq::worker");

        Self {
            id,
            hostname,
            pid,
            queues: config.queues.clone(),
            config,
            broker,
            logger,
            state: Arc::new(WorkerState::default()),
            current: None,
            signal_tasks: Vec::new(),
        }
    }

    // Rebuild a worker from its id, as stored in the `workers` set.
    fn from_id(broker: &Broker, id: &str) -> Option<Self> {
        let mut parts = id.splitn(3, ':');
        let hostname = parts.next()?.to_string();
        let pid = parts.next()?.parse().ok()?;
        let queues: Vec<String> = parts.next()?.split(',').map(String::from).collect();

        let config = WorkerConfig::new(queues.clone());
        let logger = Logger::new(config.log_level).with_target("resq::worker");
        Some(Self {
            id: id.to_string(),
            hostname,
            pid,
            queues,
            config,
            broker: broker.clone(),
            logger,
            state: Arc::new(WorkerState::default()),
            current: None,
            signal_tasks: Vec::new(),
        })
    }

    /// Every registered worker.
    pub async fn all(broker: &Broker) -> QueueResult<Vec<Worker>> {
        let ids = broker.store().smembers(WORKERS_KEY).await?;
        Ok(ids.iter().filter_map(|id| Self::from_id(broker, id)).collect())
    }

    /// Whether `id` is registered.
    pub async fn exists(broker: &Broker, id: &str) -> QueueResult<bool> {
        Ok(broker.store().sismember(WORKERS_KEY, id).await?)
    }

    /// The registered worker with this id.
    pub async fn find(broker: &Broker, id: &str) -> QueueResult<Option<Worker>> {
        if !Self::exists(broker, id).await? {
            return Ok(None);
        }
        Ok(Self::from_id(broker, id))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn set_logger(&mut self, logger: Logger) {
        self.logger = logger;
    }

    /// Control handle for this worker.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            state: self.state.clone(),
            logger: self.logger.clone(),
        }
    }

    /// Queues to reserve from, in priority order.
    ///
    /// The wildcard resolves to every known queue sorted by name, unless
    /// `fetch` is false.
    pub async fn queues(&self, fetch: bool) -> QueueResult<Vec<String>> {
        if !fetch || !self.queues.iter().any(|q| q == WILDCARD_QUEUE) {
            return Ok(self.queues.clone());
        }
        let mut queues = self.broker.queues().await?;
        queues.sort();
        Ok(queues)
    }

    /// Run until shut down.
    ///
    /// With a zero interval the worker makes a single pass, returning as
    /// soon as no job is found. The worker is registered for the duration of
    /// the call.
    pub async fn work(&mut self) -> QueueResult<()> {
        self.startup().await?;

        let result = self.run().await;

        for task in self.signal_tasks.drain(..) {
            task.abort();
        }
        let unregistered = self.unregister_worker().await;
        result.and(unregistered)
    }

    async fn startup(&mut self) -> QueueResult<()> {
        if self.config.handle_signals {
            self.register_signal_handlers()?;
        }
        self.prune_dead_workers().await?;
        self.broker
            .events()
            .trigger(Event::BeforeFirstFork, &EventData::Worker(self));
        self.register_worker().await
    }

    async fn run(&mut self) -> QueueResult<()> {
        let interval = self.config.interval;
        // A zero timeout would block forever; a single pass never blocks
        let blocking = self.config.blocking && !interval.is_zero();
        let seconds = interval.as_secs_f64();

        loop {
            if self.state.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let mut waited = false;
            let job = if self.state.paused.load(Ordering::SeqCst) {
                None
            } else {
                if blocking {
                    self.logger.info(
                        "Starting blocking with timeout of {interval}",
                        &[("interval", &seconds)],
                    );
                }
                let queues = self.queues(true).await?;
                waited = blocking && !queues.is_empty();
                self.reserve_from(&queues, blocking, interval).await?
            };

            let Some(job) = job else {
                if interval.is_zero() {
                    break;
                }
                if !waited {
                    self.logger
                        .info("Sleeping for {interval}", &[("interval", &seconds)]);
                    self.sleep(interval).await;
                }
                continue;
            };

            self.process(job).await?;
        }

        Ok(())
    }

    // Wait for `interval`, cut short by any control signal.
    async fn sleep(&self, interval: Duration) {
        let notified = self.state.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.state.shutdown.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = notified => {}
        }
    }

    /// Reserve the next job from this worker's queues.
    ///
    /// Non-blocking mode tries each queue in order; blocking mode waits up to
    /// `timeout` on all of them at once.
    pub async fn reserve(&self, blocking: bool, timeout: Duration) -> QueueResult<Option<Job>> {
        let queues = self.queues(true).await?;
        self.reserve_from(&queues, blocking, timeout).await
    }

    async fn reserve_from(
        &self,
        queues: &[String],
        blocking: bool,
        timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        if blocking {
            let job = Job::reserve_blocking(&self.broker, queues, timeout).await?;
            if let Some(job) = &job {
                self.logger
                    .info("Found job on {queue}", &[("queue", &job.queue)]);
            }
            return Ok(job);
        }

        for queue in queues {
            self.logger
                .info("Checking {queue} for jobs", &[("queue", queue)]);
            if let Some(job) = Job::reserve(&self.broker, queue).await? {
                self.logger.info("Found job on {queue}", &[("queue", queue)]);
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn process(&mut self, mut job: Job) -> QueueResult<()> {
        job.worker = Some(self.id.clone());
        self.logger
            .notice("Starting work on {job}", &[("job", &job)]);
        self.broker
            .events()
            .trigger(Event::BeforeFork, &EventData::Job(&job));
        self.working_on(&job).await?;

        let snapshot = job.clone();
        let (go, ready) = oneshot::channel::<()>();
        let broker = self.broker.clone();
        let logger = self.logger.clone();
        let mut child = tokio::spawn(async move {
            // Held back until the abort handle is registered
            if ready.await.is_err() {
                return Ok(());
            }
            perform_isolated(broker, logger, job).await
        });
        *self.state.child.lock() = Some((snapshot.to_string(), child.abort_handle()));
        let _ = go.send(());

        let joined = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut child).await {
                Ok(joined) => joined,
                Err(_) => {
                    child.abort();
                    self.state.child.lock().take();
                    let seconds = limit.as_secs_f64();
                    self.logger.error(
                        "{job} exceeded timeout of {timeout}s",
                        &[("job", &snapshot), ("timeout", &seconds)],
                    );
                    let error =
                        QueueError::DirtyExit(format!("Job exceeded timeout of {}s", seconds));
                    snapshot.fail(&self.broker, &error).await?;
                    return self.done_working().await;
                }
            },
            None => child.await,
        };
        self.state.child.lock().take();

        match joined {
            Ok(result) => result?,
            Err(e) if e.is_cancelled() => {
                // Abandoned: neither failed nor processed here
                self.logger
                    .warn("{job} was killed", &[("job", &snapshot)]);
                return Ok(());
            }
            Err(e) => {
                let error = QueueError::DirtyExit(format!("Job exited abnormally: {}", e));
                self.logger.error(
                    "{job} has failed {stack}",
                    &[("job", &snapshot), ("stack", &error)],
                );
                snapshot.fail(&self.broker, &error).await?;
            }
        }

        self.done_working().await
    }

    #[cfg(unix)]
    fn register_signal_handlers(&mut self) -> QueueResult<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let bindings: [(SignalKind, fn(&WorkerHandle)); 6] = [
            (SignalKind::terminate(), WorkerHandle::shutdown_now),
            (SignalKind::interrupt(), WorkerHandle::shutdown_now),
            (SignalKind::quit(), WorkerHandle::shutdown),
            (SignalKind::user_defined1(), WorkerHandle::kill_child),
            (SignalKind::user_defined2(), WorkerHandle::pause_processing),
            (
                SignalKind::from_raw(nix::libc::SIGCONT),
                WorkerHandle::unpause_processing,
            ),
        ];

        for (kind, action) in bindings {
            let mut stream = signal(kind).map_err(|e| {
                QueueError::Config(format!("Could not install signal handler: {}", e))
            })?;
            let handle = self.handle();
            let task = tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    action(&handle);
                }
            });
            self.signal_tasks.push(task.abort_handle());
        }

        self.logger.debug("Registered signals", &[]);
        Ok(())
    }

    #[cfg(not(unix))]
    fn register_signal_handlers(&mut self) -> QueueResult<()> {
        self.logger
            .warn("Signal handling is only available on unix", &[]);
        Ok(())
    }

    /// Unregister workers on this host whose process is gone.
    pub async fn prune_dead_workers(&self) -> QueueResult<()> {
        for worker in Self::all(&self.broker).await? {
            if worker.hostname != self.hostname || worker.id == self.id {
                continue;
            }
            if pid_alive(worker.pid) {
                continue;
            }
            self.logger
                .info("Pruning dead worker: {worker}", &[("worker", &worker)]);
            let mut worker = worker;
            worker.unregister_worker().await?;
        }
        Ok(())
    }

    /// Add this worker to the `workers` set and stamp its start time.
    pub async fn register_worker(&self) -> QueueResult<()> {
        let store = self.broker.store();
        store.sadd(WORKERS_KEY, &self.id).await?;
        store
            .set(
                &format!("worker:{}:started", self.id),
                &Local::now().format(RECORD_DATE_FORMAT).to_string(),
                Some(self.broker.config().worker_ttl),
            )
            .await?;
        Ok(())
    }

    /// Remove every trace of this worker.
    ///
    /// A job still attributed to the worker is failed as a dirty exit.
    pub async fn unregister_worker(&mut self) -> QueueResult<()> {
        let job = match self.current.take() {
            Some(job) => Some(job),
            None => self.job().await?.map(|snapshot| {
                let mut job = Job::new(snapshot.queue, snapshot.payload);
                job.worker = Some(self.id.clone());
                job
            }),
        };
        if let Some(job) = job {
            job.fail(&self.broker, &QueueError::dirty_exit()).await?;
        }

        let store = self.broker.store();
        store.srem(WORKERS_KEY, &self.id).await?;
        store.del(&format!("worker:{}", self.id)).await?;
        store.del(&format!("worker:{}:started", self.id)).await?;

        let stats = self.broker.stats();
        stats.clear(&format!("processed:{}", self.id)).await?;
        stats.clear(&format!("failed:{}", self.id)).await?;
        Ok(())
    }

    /// Mark `job` as running and record it as this worker's current job.
    ///
    /// A previously killed job still held as current is failed first.
    pub async fn working_on(&mut self, job: &Job) -> QueueResult<()> {
        if let Some(abandoned) = self.current.take() {
            abandoned.fail(&self.broker, &QueueError::dirty_exit()).await?;
        }
        job.update_status(&self.broker, Status::Running).await?;

        let snapshot = WorkerJob {
            queue: job.queue.clone(),
            run_at: Local::now().format(RECORD_DATE_FORMAT).to_string(),
            payload: job.payload.clone(),
        };
        let json =
            serde_json::to_string(&snapshot).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.broker
            .store()
            .set(
                &format!("worker:{}", self.id),
                &json,
                Some(self.broker.config().worker_ttl),
            )
            .await?;

        self.current = Some(job.clone());
        Ok(())
    }

    /// Clear the current job and count it as processed.
    pub async fn done_working(&mut self) -> QueueResult<()> {
        self.current = None;
        let stats = self.broker.stats();
        stats.incr("processed").await?;
        stats.incr(&format!("processed:{}", self.id)).await?;
        self.broker
            .store()
            .del(&format!("worker:{}", self.id))
            .await?;
        Ok(())
    }

    /// What this worker is running, as stored.
    pub async fn job(&self) -> QueueResult<Option<WorkerJob>> {
        match self.broker.store().get(&format!("worker:{}", self.id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QueueError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Per-worker counter `name`, e.g. `processed` or `failed`.
    pub async fn stat(&self, name: &str) -> QueueResult<i64> {
        self.broker
            .stats()
            .get(&format!("{}:{}", name, self.id))
            .await
    }
}

async fn perform_isolated(broker: Broker, logger: Logger, mut job: Job) -> QueueResult<()> {
    broker
        .events()
        .trigger(Event::AfterFork, &EventData::Job(&job));

    match job.perform(&broker).await {
        Ok(_) => {
            job.update_status(&broker, Status::Complete).await?;
            logger.notice("{job} has finished", &[("job", &job)]);
        }
        Err(error) => {
            logger.error(
                "{job} has failed {stack}",
                &[("job", &job), ("stack", &error)],
            );
            job.fail(&broker, &error).await?;
        }
    }
    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("current", &self.current)
            .finish()
    }
}
