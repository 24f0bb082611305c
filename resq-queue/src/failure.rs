//! Failure recording.

use async_trait::async_trait;
use chrono::Local;
use resq_redis::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{QueueError, QueueResult};
use crate::job::Payload;

/// Key of the list failure records are appended to.
pub const FAILED_KEY: &str = "failed";

/// Timestamp layout used in failure records and worker snapshots.
pub(crate) const RECORD_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %Z %Y";

/// One failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failed_at: String,
    pub payload: Payload,
    /// Error kind, see [`QueueError::kind`]
    pub exception: String,
    pub error: String,
    pub backtrace: Vec<String>,
    pub worker: String,
    pub queue: String,
}

impl FailureRecord {
    /// Build a record stamped with the current local time.
    pub fn new(payload: &Payload, error: &QueueError, worker: &str, queue: &str) -> Self {
        Self {
            failed_at: Local::now().format(RECORD_DATE_FORMAT).to_string(),
            payload: payload.clone(),
            exception: error.kind().to_string(),
            error: error.to_string(),
            backtrace: error.backtrace_lines(),
            worker: worker.to_string(),
            queue: queue.to_string(),
        }
    }
}

/// Where failures go.
#[async_trait]
pub trait FailureBackend: Send + Sync {
    /// Persist one failure.
    async fn record(
        &self,
        payload: &Payload,
        error: &QueueError,
        worker: &str,
        queue: &str,
    ) -> QueueResult<()>;
}

/// Appends JSON failure records to the `failed` list.
pub struct StoreFailureBackend {
    store: Arc<dyn Store>,
}

impl StoreFailureBackend {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Number of recorded failures.
    pub async fn count(&self) -> QueueResult<u64> {
        Ok(self.store.llen(FAILED_KEY).await?)
    }

    /// Every recorded failure, oldest first.
    pub async fn all(&self) -> QueueResult<Vec<FailureRecord>> {
        self.store
            .lrange(FAILED_KEY, 0, -1)
            .await?
            .iter()
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| QueueError::Deserialization(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl FailureBackend for StoreFailureBackend {
    async fn record(
        &self,
        payload: &Payload,
        error: &QueueError,
        worker: &str,
        queue: &str,
    ) -> QueueResult<()> {
        let record = FailureRecord::new(payload, error, worker, queue);
        let json =
            serde_json::to_string(&record).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.store.rpush(FAILED_KEY, &json).await?;
        Ok(())
    }
}
