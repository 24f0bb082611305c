//! The store capability the queue engine is built on.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Key/value, list and set primitives.
///
/// One method per command. Keys are passed through untouched; prefixing is
/// the job of [`NamespacedStore`](crate::NamespacedStore).
#[async_trait]
pub trait Store: Send + Sync {
    /// GET.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// SET, with an optional expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// SET NX, with an optional expiry. Returns whether the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// DEL. Returns the number of keys removed.
    async fn del(&self, key: &str) -> Result<u64>;

    /// EXISTS.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// INCRBY.
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64>;

    /// DECRBY.
    async fn decr_by(&self, key: &str, by: i64) -> Result<i64>;

    /// SADD. Returns whether the member was added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// SREM. Returns whether the member was removed.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// SMEMBERS.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// SISMEMBER.
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    /// RPUSH. Returns the length of the list after the push.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;

    /// LPOP.
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    /// RPOP.
    async fn rpop(&self, key: &str) -> Result<Option<String>>;

    /// BLPOP across `keys` in priority order.
    ///
    /// Returns the key the item came from and the item. A zero timeout
    /// blocks until an item arrives.
    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    /// RPOPLPUSH.
    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>>;

    /// LLEN.
    async fn llen(&self, key: &str) -> Result<u64>;

    /// LRANGE with inclusive, possibly negative, bounds.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Prefix this store applies to every key.
    fn prefix(&self) -> &str {
        ""
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        (**self).set_nx(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<u64> {
        (**self).del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key).await
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64> {
        (**self).incr_by(key, by).await
    }

    async fn decr_by(&self, key: &str, by: i64) -> Result<i64> {
        (**self).decr_by(key, by).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        (**self).sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        (**self).srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        (**self).smembers(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        (**self).sismember(key, member).await
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        (**self).rpush(key, value).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        (**self).lpop(key).await
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        (**self).rpop(key).await
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        (**self).blpop(keys, timeout).await
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        (**self).rpoplpush(source, destination).await
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        (**self).llen(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        (**self).lrange(key, start, stop).await
    }

    fn prefix(&self) -> &str {
        (**self).prefix()
    }
}
