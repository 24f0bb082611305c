//! In-process implementation of [`Store`].
//!
//! Mirrors the Redis semantics the queue relies on: lazy key expiry, empty
//! lists and sets cease to exist, and WRONGTYPE errors when a command meets a
//! key of another type. Used by tests and by embedded, single-process setups.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{RedisError, Result, Store};

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn list_mut(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(RedisError::Command(WRONG_TYPE.to_string())),
        }
    }

    fn list_or_create(&mut self, key: &str) -> Result<&mut VecDeque<String>> {
        if self.list_mut(key)?.is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::List(VecDeque::new()), None));
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list),
            _ => Err(RedisError::Command(WRONG_TYPE.to_string())),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<Option<&mut BTreeSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(RedisError::Command(WRONG_TYPE.to_string())),
        }
    }

    /// Drop a list or set that has become empty.
    fn reap(&mut self, key: &str) {
        let empty = match self.entries.get(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.is_empty(),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn pop_front(&mut self, key: &str) -> Result<Option<String>> {
        let item = match self.list_mut(key)? {
            Some(list) => list.pop_front(),
            None => None,
        };
        self.reap(key);
        Ok(item)
    }

    fn pop_back(&mut self, key: &str) -> Result<Option<String>> {
        let item = match self.list_mut(key)? {
            Some(list) => list.pop_back(),
            None => None,
        };
        self.reap(key);
        Ok(item)
    }

    fn add_to_counter(&mut self, key: &str, by: i64) -> Result<i64> {
        let (current, expires_at) = match self.live(key) {
            None => (0, None),
            Some(Entry {
                value: Value::Str(s),
                expires_at,
            }) => {
                let current = s
                    .parse::<i64>()
                    .map_err(|_| RedisError::Command("value is not an integer".to_string()))?;
                (current, *expires_at)
            }
            Some(_) => return Err(RedisError::Command(WRONG_TYPE.to_string())),
        };

        let next = current
            .checked_add(by)
            .ok_or_else(|| RedisError::Command("increment would overflow".to_string()))?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    pushed: Notify,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every key.
    pub fn flush(&self) {
        self.keyspace.lock().entries.clear();
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    fn try_pop_first(&self, keys: &[String]) -> Result<Option<(String, String)>> {
        let mut keyspace = self.keyspace.lock();
        for key in keys {
            if let Some(item) = keyspace.pop_front(key)? {
                return Ok(Some((key.clone(), item)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.keyspace.lock().live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(RedisError::Command(WRONG_TYPE.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.keyspace.lock().entries.insert(
            key.to_string(),
            Entry::new(Value::Str(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        keyspace.entries.insert(
            key.to_string(),
            Entry::new(Value::Str(value.to_string()), ttl),
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut keyspace = self.keyspace.lock();
        let existed = keyspace.live(key).is_some();
        keyspace.entries.remove(key);
        Ok(u64::from(existed))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.keyspace.lock().live(key).is_some())
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64> {
        self.keyspace.lock().add_to_counter(key, by)
    }

    async fn decr_by(&self, key: &str, by: i64) -> Result<i64> {
        let by = by
            .checked_neg()
            .ok_or_else(|| RedisError::Command("decrement would overflow".to_string()))?;
        self.keyspace.lock().add_to_counter(key, by)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut keyspace = self.keyspace.lock();
        if let Some(set) = keyspace.set_mut(key)? {
            return Ok(set.insert(member.to_string()));
        }
        let mut set = BTreeSet::new();
        set.insert(member.to_string());
        keyspace
            .entries
            .insert(key.to_string(), Entry::new(Value::Set(set), None));
        Ok(true)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut keyspace = self.keyspace.lock();
        let removed = match keyspace.set_mut(key)? {
            Some(set) => set.remove(member),
            None => false,
        };
        keyspace.reap(key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .keyspace
            .lock()
            .set_mut(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .keyspace
            .lock()
            .set_mut(key)?
            .is_some_and(|set| set.contains(member)))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let len = {
            let mut keyspace = self.keyspace.lock();
            let list = keyspace.list_or_create(key)?;
            list.push_back(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.keyspace.lock().pop_front(key)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        self.keyspace.lock().pop_back(key)
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop_first(keys)? {
                return Ok(Some(hit));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        let moved = {
            let mut keyspace = self.keyspace.lock();
            // Type-check the destination before taking anything off the source
            keyspace.list_mut(destination)?;
            match keyspace.pop_back(source)? {
                Some(item) => {
                    keyspace.list_or_create(destination)?.push_front(item.clone());
                    Some(item)
                }
                None => None,
            }
        };
        if moved.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        Ok(self
            .keyspace
            .lock()
            .list_mut(key)?
            .map(|list| list.len() as u64)
            .unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut keyspace = self.keyspace.lock();
        let Some(list) = keyspace.list_mut(key)? else {
            return Ok(Vec::new());
        };

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_strings_and_ttl() {
        tokio::time::pause();
        let store = MemoryStore::new();

        store
            .set("key", "value", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("value"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("key").await.unwrap(), None);
        assert!(!store.exists("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "1", None).await.unwrap());
        assert!(!store.set_nx("k", "2", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("n", 5).await.unwrap(), 5);
        assert_eq!(store.decr_by("n", 2).await.unwrap(), 3);

        store.set("s", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr_by("s", 1).await,
            Err(RedisError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_incr_keeps_ttl() {
        tokio::time::pause();
        let store = MemoryStore::new();
        assert!(
            store
                .set_nx("n", "1", Some(Duration::from_secs(5)))
                .await
                .unwrap()
        );
        store.incr_by("n", 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("n").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lists_are_fifo_and_vanish_when_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.rpush("q", "a").await.unwrap(), 1);
        assert_eq!(store.rpush("q", "b").await.unwrap(), 2);

        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.lpop("q").await.unwrap(), None);
        assert!(!store.exists("q").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.rpush("k", "x").await.is_err());
        assert!(store.sadd("k", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_rpoplpush_rotates_tail_to_head() {
        let store = MemoryStore::new();
        for item in ["a", "b", "c"] {
            store.rpush("src", item).await.unwrap();
        }
        store.rpush("dst", "z").await.unwrap();

        assert_eq!(
            store.rpoplpush("src", "dst").await.unwrap().as_deref(),
            Some("c")
        );
        assert_eq!(store.lrange("src", 0, -1).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.lrange("dst", 0, -1).await.unwrap(), vec!["c", "z"]);
    }

    #[tokio::test]
    async fn test_lrange_bounds() {
        let store = MemoryStore::new();
        for item in ["a", "b", "c", "d"] {
            store.rpush("l", item).await.unwrap();
        }
        assert_eq!(store.lrange("l", 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec!["c", "d"]);
        assert_eq!(store.lrange("l", 0, 100).await.unwrap().len(), 4);
        assert!(store.lrange("l", 5, 10).await.unwrap().is_empty());
        assert!(store.lrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        assert!(store.sadd("s", "b").await.unwrap());
        assert!(store.sadd("s", "a").await.unwrap());
        assert!(!store.sadd("s", "a").await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b"]);
        assert!(store.sismember("s", "a").await.unwrap());

        assert!(store.srem("s", "a").await.unwrap());
        assert!(store.srem("s", "b").await.unwrap());
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_blpop_honours_key_priority() {
        let store = MemoryStore::new();
        store.rpush("low", "1").await.unwrap();
        store.rpush("high", "2").await.unwrap();

        let keys = vec!["high".to_string(), "low".to_string()];
        let hit = store.blpop(&keys, Duration::from_secs(1)).await.unwrap();
        assert_eq!(hit, Some(("high".to_string(), "2".to_string())));
    }

    #[tokio::test]
    async fn test_blpop_times_out() {
        tokio::time::pause();
        let store = MemoryStore::new();
        let hit = store
            .blpop(&["q".to_string()], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn test_blpop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.blpop(&["q".to_string()], Duration::ZERO).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.rpush("q", "job").await.unwrap();

        let hit = waiter.await.unwrap().unwrap();
        assert_eq!(hit, Some(("q".to_string(), "job".to_string())));
    }
}
