//! Broker and worker configuration.

use resq_log::Level;
use std::env;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};
use crate::stat::DEFAULT_STAT_TTL;
use crate::status::DEFAULT_STATUS_TTL;

/// Queue name that stands for every known queue.
pub const WILDCARD_QUEUE: &str = "*";

/// Default poll interval / blocking timeout.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Lifetime of worker bookkeeping keys.
pub const DEFAULT_WORKER_TTL: Duration = Duration::from_secs(172_800);

/// Settings shared by everything that talks to the store.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Lifetime of job status records
    pub status_ttl: Duration,
    /// Lifetime of counters, applied on first write
    pub stat_ttl: Duration,
    /// Lifetime of worker snapshot and start-time keys
    pub worker_ttl: Duration,
    /// Turn stat counters into no-ops
    pub disable_stats: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            status_ttl: DEFAULT_STATUS_TTL,
            stat_ttl: DEFAULT_STAT_TTL,
            worker_ttl: DEFAULT_WORKER_TTL,
            disable_stats: false,
        }
    }
}

impl BrokerConfig {
    /// Read `RESQ_STATUS_TTL`, `RESQ_STAT_TTL` (seconds) and `RESQ_DISABLE_STATS`.
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();

        if let Some(ttl) = env_seconds("RESQ_STATUS_TTL")? {
            config.status_ttl = ttl;
        }
        if let Some(ttl) = env_seconds("RESQ_STAT_TTL")? {
            config.stat_ttl = ttl;
        }
        config.disable_stats = env_flag("RESQ_DISABLE_STATS");

        Ok(config)
    }

    /// Set the status record lifetime.
    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// Set the counter lifetime.
    pub fn with_stat_ttl(mut self, ttl: Duration) -> Self {
        self.stat_ttl = ttl;
        self
    }

    /// Switch stat counters off.
    pub fn with_disable_stats(mut self, disabled: bool) -> Self {
        self.disable_stats = disabled;
        self
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues in priority order, or `["*"]` for every known queue
    pub queues: Vec<String>,

    /// Poll interval, or blocking timeout in blocking mode. Zero runs a
    /// single pass and returns as soon as no job is found.
    pub interval: Duration,

    /// Use a blocking pop instead of polling
    pub blocking: bool,

    /// Abort jobs running longer than this
    pub job_timeout: Option<Duration>,

    /// Install unix signal handlers when work starts
    pub handle_signals: bool,

    /// Threshold of the worker's logger
    pub log_level: Level,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![WILDCARD_QUEUE.to_string()],
            interval: DEFAULT_INTERVAL,
            blocking: false,
            job_timeout: None,
            handle_signals: false,
            log_level: Level::Warn,
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for `queues`.
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Read `QUEUE`, `INTERVAL`, `BLOCKING`, `JOB_TIMEOUT`, `LOGGING`,
    /// `VERBOSE` and `VVERBOSE`.
    ///
    /// A missing `QUEUE` is a configuration error. Signal handling is
    /// enabled, as this is how a standalone worker process is configured.
    pub fn from_env() -> QueueResult<Self> {
        let queues = env::var("QUEUE")
            .ok()
            .map(|raw| parse_queue_list(&raw))
            .filter(|queues| !queues.is_empty())
            .ok_or_else(|| {
                QueueError::Config(
                    "Set QUEUE env var containing the list of queues to work.".to_string(),
                )
            })?;

        let mut config = Self::new(queues);
        config.handle_signals = true;

        if let Some(interval) = env_seconds("INTERVAL")? {
            config.interval = interval;
        }
        config.blocking = env_flag("BLOCKING");
        config.job_timeout = env_seconds("JOB_TIMEOUT")?.filter(|t| !t.is_zero());

        if env_flag("VVERBOSE") {
            config.log_level = Level::Debug;
        } else if env_flag("LOGGING") || env_flag("VERBOSE") {
            config.log_level = Level::Info;
        }

        Ok(config)
    }

    /// Set the poll interval / blocking timeout.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Use blocking reservation.
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Abort jobs running longer than `timeout`.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Install unix signal handlers when work starts.
    pub fn with_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Set the worker's log threshold.
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }
}

/// Split a comma separated queue list, dropping blanks.
pub fn parse_queue_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(String::from)
        .collect()
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

fn env_seconds(name: &str) -> QueueResult<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Some(Duration::from_secs_f64(secs)))
            .ok_or_else(|| {
                QueueError::Config(format!(
                    "{} must be a number of seconds, got '{}'",
                    name, raw
                ))
            }),
        Err(_) => Ok(None),
    }
}
