//! Per-job status tracking.
//!
//! Tracking is opt-in: a job is tracked when a status record was created for
//! it at enqueue time. The record moves WAITING -> RUNNING -> FAILED or
//! COMPLETE; the last two are terminal.

use chrono::Utc;
use parking_lot::Mutex;
use resq_redis::Store;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// Default lifetime of a status record.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(172_800);

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Status {
    /// Queued, not yet picked up
    Waiting = 1,
    /// Picked up by a worker
    Running = 2,
    /// Finished with an error
    Failed = 3,
    /// Finished successfully
    Complete = 4,
}

impl Status {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Failed | Status::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Failed => "failed",
            Status::Complete => "complete",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Status::Waiting),
            2 => Ok(Status::Running),
            3 => Ok(Status::Failed),
            4 => Ok(Status::Complete),
            other => Err(format!("unknown job status code {}", other)),
        }
    }
}

/// Persisted status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    /// Unix timestamp of the last change
    pub updated: i64,
    /// Unix timestamp of creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<i64>,
}

/// Status tracker for a single job id.
pub struct StatusTracker {
    store: Arc<dyn Store>,
    id: String,
    ttl: Duration,
    // Only a negative answer is cached; a positive one is rechecked so a
    // stopped record is noticed.
    not_tracking: Mutex<bool>,
}

impl StatusTracker {
    /// Tracker for job `id`.
    pub fn new(store: Arc<dyn Store>, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
            ttl: DEFAULT_STATUS_TTL,
            not_tracking: Mutex::new(false),
        }
    }

    /// Override the record lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Job id this tracker watches.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> String {
        format!("job:{}:status", self.id)
    }

    /// Start tracking: write a WAITING record.
    pub async fn create(&self) -> QueueResult<()> {
        let now = Utc::now().timestamp();
        let record = StatusRecord {
            status: Status::Waiting,
            updated: now,
            started: Some(now),
        };
        self.write(&record).await?;
        *self.not_tracking.lock() = false;
        Ok(())
    }

    /// Whether a record exists for this job.
    pub async fn is_tracking(&self) -> QueueResult<bool> {
        if *self.not_tracking.lock() {
            return Ok(false);
        }
        let tracking = self.store.exists(&self.key()).await?;
        if !tracking {
            *self.not_tracking.lock() = true;
        }
        Ok(tracking)
    }

    /// Move the record to `status`.
    ///
    /// A no-op when the job is not tracked or already in a terminal state.
    pub async fn update(&self, status: Status) -> QueueResult<()> {
        if !self.is_tracking().await? {
            return Ok(());
        }

        let current = self.record().await?;
        if let Some(current) = &current
            && current.status.is_terminal()
        {
            return Ok(());
        }

        let record = StatusRecord {
            status,
            updated: Utc::now().timestamp(),
            started: current.and_then(|r| r.started),
        };
        self.write(&record).await
    }

    /// Current status, or `None` when the job is not tracked.
    pub async fn get(&self) -> QueueResult<Option<Status>> {
        Ok(self.record().await?.map(|r| r.status))
    }

    /// The full record, or `None` when the job is not tracked.
    pub async fn record(&self) -> QueueResult<Option<StatusRecord>> {
        if !self.is_tracking().await? {
            return Ok(None);
        }
        match self.store.get(&self.key()).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QueueError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Stop tracking and delete the record.
    pub async fn stop(&self) -> QueueResult<()> {
        self.store.del(&self.key()).await?;
        *self.not_tracking.lock() = true;
        Ok(())
    }

    async fn write(&self, record: &StatusRecord) -> QueueResult<()> {
        let json =
            serde_json::to_string(record).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.store.set(&self.key(), &json, Some(self.ttl)).await?;
        Ok(())
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .finish()
    }
}
