//! Key-prefixing decorator.

use async_trait::async_trait;
use std::time::Duration;

use crate::{Result, Store};

/// Prefixes every key with a namespace before handing the command to `S`.
///
/// The namespace is normalised to end in `:` unless it is empty. Values are
/// never touched, and the key BLPOP reports is returned prefixed, exactly as
/// the server reports it.
pub struct NamespacedStore<S> {
    inner: S,
    prefix: String,
}

impl<S: Store> NamespacedStore<S> {
    /// Wrap `inner`, prefixing keys with `namespace`.
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        let mut prefix = namespace.into();
        if !prefix.is_empty() && !prefix.ends_with(':') {
            prefix.push(':');
        }
        Self { inner, prefix }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl<S: Store> Store for NamespacedStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(&self.key(key), value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.inner.set_nx(&self.key(key), value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<u64> {
        self.inner.del(&self.key(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(&self.key(key)).await
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64> {
        self.inner.incr_by(&self.key(key), by).await
    }

    async fn decr_by(&self, key: &str, by: i64) -> Result<i64> {
        self.inner.decr_by(&self.key(key), by).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.sadd(&self.key(key), member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.srem(&self.key(key), member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.smembers(&self.key(key)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.sismember(&self.key(key), member).await
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        self.inner.rpush(&self.key(key), value).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.inner.lpop(&self.key(key)).await
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        self.inner.rpop(&self.key(key)).await
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        self.inner.blpop(&keys, timeout).await
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        self.inner
            .rpoplpush(&self.key(source), &self.key(destination))
            .await
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.inner.llen(&self.key(key)).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.inner.lrange(&self.key(key), start, stop).await
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_prefix_normalisation() {
        assert_eq!(NamespacedStore::new(MemoryStore::new(), "resque").prefix(), "resque:");
        assert_eq!(NamespacedStore::new(MemoryStore::new(), "app:").prefix(), "app:");
        assert_eq!(NamespacedStore::new(MemoryStore::new(), "").prefix(), "");
    }

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let memory = Arc::new(MemoryStore::new());
        let store = NamespacedStore::new(memory.clone(), "resque");

        store.set("stat:processed", "1", None).await.unwrap();
        assert_eq!(
            memory.get("resque:stat:processed").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(memory.get("stat:processed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rpoplpush_prefixes_both_keys() {
        let memory = Arc::new(MemoryStore::new());
        let store = NamespacedStore::new(memory.clone(), "ns");

        store.rpush("queue:a", "x").await.unwrap();
        store.rpoplpush("queue:a", "queue:b").await.unwrap();

        assert_eq!(memory.llen("ns:queue:a").await.unwrap(), 0);
        assert_eq!(memory.llen("ns:queue:b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blpop_reports_prefixed_key() {
        let store = NamespacedStore::new(MemoryStore::new(), "resque");
        store.rpush("queue:low", "job").await.unwrap();

        let popped = store
            .blpop(
                &["queue:high".to_string(), "queue:low".to_string()],
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(
            popped,
            Some(("resque:queue:low".to_string(), "job".to_string()))
        );
    }
}
