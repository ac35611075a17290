//! Redis backend

use crate::error::{GuardError, Result};
use crate::remote::{ttl_millis, RemoteCache};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info};

/// Delete KEYS[1] only when it still holds ARGV[1]
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// [`RemoteCache`] backed by a Redis server
///
/// Cloning is cheap; clones share the same multiplexed connection.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisCache {
    /// Connect to the Redis server at `url` (e.g. "redis://127.0.0.1:6379")
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", url);

        let client = redis::Client::open(url)
            .map_err(|e| GuardError::ConfigError(format!("invalid Redis URL '{}': {}", url, e)))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| GuardError::ConnectionError(e.to_string()))?;

        info!("Successfully connected to Redis");

        Ok(Self {
            manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
        })
    }

    /// Round-trip a PING to check the server is reachable
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis PING -> {}", reply);
        Ok(())
    }
}

#[async_trait]
impl RemoteCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        // SET NX replies OK when written and nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<i64> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }
}
