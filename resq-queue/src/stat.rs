//! Named counters (`stat:<name>`).

use resq_redis::Store;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueResult;

/// Default lifetime applied when a counter is first written.
pub const DEFAULT_STAT_TTL: Duration = Duration::from_secs(86_400);

/// Integer counters backed by the store.
#[derive(Clone)]
pub struct StatCounter {
    store: Arc<dyn Store>,
    ttl: Duration,
    disabled: bool,
}

impl StatCounter {
    /// Create counters over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            ttl: DEFAULT_STAT_TTL,
            disabled: false,
        }
    }

    /// Override the lifetime of newly created counters.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Turn every operation into a no-op.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Whether counting is switched off.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn key(name: &str) -> String {
        format!("stat:{}", name)
    }

    /// Current value; 0 when absent.
    pub async fn get(&self, name: &str) -> QueueResult<i64> {
        if self.disabled {
            return Ok(0);
        }
        let value = self.store.get(&Self::key(name)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Increment by one.
    pub async fn incr(&self, name: &str) -> QueueResult<()> {
        self.incr_by(name, 1).await
    }

    /// Increment by `by`. The first write sets the TTL.
    pub async fn incr_by(&self, name: &str, by: i64) -> QueueResult<()> {
        if self.disabled {
            return Ok(());
        }
        let key = Self::key(name);
        if !self.store.set_nx(&key, &by.to_string(), Some(self.ttl)).await? {
            self.store.incr_by(&key, by).await?;
        }
        Ok(())
    }

    /// Decrement by one.
    pub async fn decr(&self, name: &str) -> QueueResult<()> {
        self.decr_by(name, 1).await
    }

    /// Decrement by `by`.
    pub async fn decr_by(&self, name: &str, by: i64) -> QueueResult<()> {
        if self.disabled {
            return Ok(());
        }
        self.store.decr_by(&Self::key(name), by).await?;
        Ok(())
    }

    /// Delete the counter.
    pub async fn clear(&self, name: &str) -> QueueResult<()> {
        if self.disabled {
            return Ok(());
        }
        self.store.del(&Self::key(name)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for StatCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCounter")
            .field("ttl", &self.ttl)
            .field("disabled", &self.disabled)
            .finish()
    }
}
