//! Access to the Redis-compatible key/value stores.
//!
//! Every consumer goes through [`KeyValueStore`], so the cache-backed
//! components can be exercised against [`memory::MemoryStore`] in tests.

use async_trait::async_trait;
use redis::AsyncCommands;

pub mod memory;
pub mod pipeline;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<i64, StoreError>;

    /// `LRANGE key start stop` semantics: both bounds inclusive.
    async fn list_range(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<String>, StoreError>;

    /// Atomically replaces the list at `key` with `values` — a `MULTI`
    /// transaction of `DEL` then `RPUSH`, or `DEL` alone when `values` is
    /// empty.
    async fn replace_list(&self, key: &str, values: Vec<String>) -> Result<(), StoreError>;
}

/// A store backed by one multiplexed Redis connection. Cloning the
/// connection per call is how the redis crate shares a multiplexed
/// connection between tasks.
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// `host` is a bare `host:port` as supplied by the `*_REDIS_HOST`
    /// environment variables.
    pub async fn connect(host: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{host}"))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(key, start as isize, stop as isize).await?;
        Ok(values)
    }

    async fn replace_list(&self, key: &str, values: Vec<String>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(key).ignore();
        if !values.is_empty() {
            pipe.cmd("RPUSH").arg(key).arg(&values).ignore();
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
