//! Pooled Redis implementation of [`Store`].

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    Result, Store,
    pool::{RedisConnection, RedisPool, RedisPoolBuilder},
    RedisConfig,
};

/// Redis-backed store.
///
/// Every command checks a connection out of the pool for its own duration, so
/// a long BLPOP on one task never holds up commands issued by another.
pub struct RedisStore {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisStore {
    /// Connect and build the pool.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = RedisPoolBuilder::new(config.clone()).build().await?;
        Ok(Self { config, pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Get a connection from the pool.
    pub async fn connection(&self) -> Result<RedisConnection<'_>> {
        let conn = self.pool.get().await?;
        Ok(RedisConnection::new(conn))
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

fn expiry_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(expiry_millis(ttl));
        }
        let _: () = cmd.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(expiry_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut *conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut *conn).await?;
        Ok(exists)
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn decr_by(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = redis::cmd("DECRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let added: u64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut *conn).await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let is_member: bool = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(is_member)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut *conn)
            .await?;
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("RPOP").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let mut conn = self.connection().await?;
        let value: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(source)
            .arg(destination)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = redis::cmd("LLEN").arg(key).query_async(&mut *conn).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut *conn)
            .await?;
        Ok(items)
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
}
