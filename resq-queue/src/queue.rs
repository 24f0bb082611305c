//! Queue operations over store-backed lists.
//!
//! A queue is the list `queue:<name>` plus membership of `<name>` in the
//! `queues` set. Items are pushed at the tail and popped from the head.

use chrono::Utc;
use resq_log::{debug, warn};
use resq_redis::Store;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::job::Payload;

/// Set of known queue names.
pub const QUEUES_KEY: &str = "queues";

/// Set of temp lists belonging to in-flight filtered dequeues.
pub const DEQUEUES_KEY: &str = "dequeues";

const TEMP_MARKER: &str = ":temp:";

/// Key of the list backing `queue`.
pub fn queue_key(queue: &str) -> String {
    format!("queue:{}", queue)
}

/// Selects queue entries for [`QueueEngine::dequeue`].
#[derive(Debug, Clone, PartialEq)]
pub enum MatchSpec {
    /// Every entry of this class.
    Class(String),
    /// Entries of this class whose argument mapping agrees with the given
    /// one. Key order is irrelevant.
    ClassWithArgs(String, Map<String, Value>),
    /// The entry of this class with this id.
    ClassWithId(String, String),
}

impl MatchSpec {
    pub fn class(class: impl Into<String>) -> Self {
        Self::Class(class.into())
    }

    /// Match on arguments. Anything but a JSON object matches nothing.
    pub fn with_args(class: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::ClassWithArgs(class.into(), args)
    }

    pub fn with_id(class: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ClassWithId(class.into(), id.into())
    }

    /// Whether `payload` is selected by this match.
    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            MatchSpec::Class(class) => payload.class == *class,
            MatchSpec::ClassWithArgs(class, wanted) => {
                if payload.class != *class || wanted.is_empty() {
                    return false;
                }
                // Every argument the entry carries must be wanted with the
                // same value.
                match payload.args.first() {
                    Some(Value::Object(actual)) if !actual.is_empty() => actual
                        .iter()
                        .all(|(key, value)| wanted.get(key) == Some(value)),
                    _ => false,
                }
            }
            MatchSpec::ClassWithId(class, id) => {
                payload.class == *class && payload.id.as_deref() == Some(id.as_str())
            }
        }
    }
}

/// Push, pop and filter operations on queues.
#[derive(Clone)]
pub struct QueueEngine {
    store: Arc<dyn Store>,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append `payload` to `queue`, registering the queue.
    ///
    /// Returns `false` when the payload could not be serialized or the list
    /// did not grow.
    pub async fn push(&self, queue: &str, payload: &Payload) -> QueueResult<bool> {
        let encoded = match serde_json::to_string(payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Could not encode payload for {}: {}", queue, e);
                return Ok(false);
            }
        };

        self.store.sadd(QUEUES_KEY, queue).await?;
        let length = self.store.rpush(&queue_key(queue), &encoded).await?;
        Ok(length >= 1)
    }

    /// Take the head of `queue`.
    pub async fn pop(&self, queue: &str) -> QueueResult<Option<Payload>> {
        match self.store.lpop(&queue_key(queue)).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Wait up to `timeout` for an item on any of `queues`, earlier queues
    /// first. Returns the queue name and the item.
    pub async fn blocking_pop(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> QueueResult<Option<(String, Payload)>> {
        if queues.is_empty() {
            return Ok(None);
        }

        let keys: Vec<String> = queues.iter().map(|q| queue_key(q)).collect();
        let Some((key, raw)) = self.store.blpop(&keys, timeout).await? else {
            return Ok(None);
        };

        let prefix = format!("{}queue:", self.store.prefix());
        let queue = key
            .strip_prefix(&prefix)
            .or_else(|| key.strip_prefix("queue:"))
            .unwrap_or(&key)
            .to_string();
        Ok(Some((queue, decode(&raw)?)))
    }

    /// Number of items in `queue`.
    pub async fn size(&self, queue: &str) -> QueueResult<u64> {
        Ok(self.store.llen(&queue_key(queue)).await?)
    }

    /// Known queue names, unordered.
    pub async fn queues(&self) -> QueueResult<Vec<String>> {
        Ok(self.store.smembers(QUEUES_KEY).await?)
    }

    /// Forget `queue` and delete its items. Returns how many were removed.
    pub async fn remove_queue(&self, queue: &str) -> QueueResult<u64> {
        self.store.srem(QUEUES_KEY, queue).await?;
        self.remove_list(queue).await
    }

    /// Remove the entries of `queue` selected by `specs`, keeping the rest in
    /// order. With no specs the whole list is dropped.
    ///
    /// Returns the number of entries removed.
    pub async fn dequeue(&self, queue: &str, specs: &[MatchSpec]) -> QueueResult<u64> {
        if specs.is_empty() {
            return self.remove_list(queue).await;
        }
        self.remove_items(queue, specs).await
    }

    async fn remove_list(&self, queue: &str) -> QueueResult<u64> {
        let key = queue_key(queue);
        let size = self.store.llen(&key).await?;
        let deleted = self.store.del(&key).await?;
        Ok(if deleted == 1 { size } else { 0 })
    }

    // Every item is rotated off the tail of the queue into a temp list. Matches
    // are dropped from there; the rest move on to a requeue list, which is
    // finally rotated back onto the queue in the original order. Both lists are
    // named per run and recorded in `dequeues` until the run completes.
    async fn remove_items(&self, queue: &str, specs: &[MatchSpec]) -> QueueResult<u64> {
        let original = queue_key(queue);
        let temp = format!(
            "{}{}{}:{}",
            original,
            TEMP_MARKER,
            Utc::now().timestamp(),
            Uuid::new_v4().simple()
        );
        let requeue = format!("{}:requeue", temp);

        self.store.sadd(DEQUEUES_KEY, &temp).await?;

        let mut removed = 0;
        while let Some(raw) = self.store.rpoplpush(&original, &temp).await? {
            let selected = match serde_json::from_str::<Payload>(&raw) {
                Ok(payload) => specs.iter().any(|spec| spec.matches(&payload)),
                Err(_) => false,
            };

            if selected {
                self.store.rpop(&temp).await?;
                removed += 1;
            } else {
                self.store.rpoplpush(&temp, &requeue).await?;
            }
        }

        while self.store.rpoplpush(&requeue, &original).await?.is_some() {}

        self.store.del(&requeue).await?;
        self.store.del(&temp).await?;
        self.store.srem(DEQUEUES_KEY, &temp).await?;

        debug!("Dequeued {} item(s) from {}", removed, queue);
        Ok(removed)
    }

    /// Put back items stranded by filtered dequeues that never finished.
    ///
    /// Only runs started at least `older_than` ago are touched, so a dequeue
    /// in progress elsewhere is left alone. Recovered items go to the head of
    /// their queue. Returns the number of items recovered.
    pub async fn recover_interrupted_dequeues(&self, older_than: Duration) -> QueueResult<u64> {
        let now = Utc::now().timestamp();
        let mut recovered = 0;

        for temp in self.store.smembers(DEQUEUES_KEY).await? {
            let Some((original, started)) = parse_temp_key(&temp) else {
                warn!("Ignoring malformed dequeue marker {}", temp);
                self.store.srem(DEQUEUES_KEY, &temp).await?;
                continue;
            };
            if now.saturating_sub(started) < older_than.as_secs() as i64 {
                continue;
            }

            let requeue = format!("{}:requeue", temp);
            while self.store.rpoplpush(&temp, &requeue).await?.is_some() {}
            while self.store.rpoplpush(&requeue, original).await?.is_some() {
                recovered += 1;
            }

            self.store.del(&requeue).await?;
            self.store.del(&temp).await?;
            self.store.srem(DEQUEUES_KEY, &temp).await?;
            debug!("Recovered interrupted dequeue {}", temp);
        }

        Ok(recovered)
    }
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("prefix", &self.store.prefix())
            .finish()
    }
}

fn decode(raw: &str) -> QueueResult<Payload> {
    serde_json::from_str(raw).map_err(|e| QueueError::Deserialization(e.to_string()))
}

/// Split `queue:<name>:temp:<ts>:<uuid>` into the queue key and start time.
fn parse_temp_key(temp: &str) -> Option<(&str, i64)> {
    let at = temp.rfind(TEMP_MARKER)?;
    let original = &temp[..at];
    let started = temp[at + TEMP_MARKER.len()..].split(':').next()?.parse().ok()?;
    Some((original, started))
}
