//! Redis-backed shared cache.

use crate::cache::SharedCache;
use crate::error::CacheError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Removes ARGV from the set KEYS[1] and returns the remaining size, or -1
/// when the set does not exist.
const REMOVE_AND_COUNT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
if #ARGV > 0 then
    redis.call('SREM', KEYS[1], unpack(ARGV))
end
return redis.call('SCARD', KEYS[1])
";

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable {
            message: e.to_string(),
        }
    }
}

/// Shared cache on a Redis server.
///
/// The connection manager reconnects on its own; clones share it.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    compare_and_delete: Script,
    remove_and_count: Script,
}

impl RedisCache {
    /// Connects to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            remove_and_count: Script::new(REMOVE_AND_COUNT),
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Duration) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(key)
            .arg(members)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<Option<u64>, CacheError> {
        let mut conn = self.manager.clone();
        let remaining: i64 = self
            .remove_and_count
            .key(key)
            .arg(members)
            .invoke_async(&mut conn)
            .await?;
        Ok(u64::try_from(remaining).ok())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_to_at_least_one_millisecond() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn redis_errors_map_to_unavailable() {
        let err: CacheError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into();
        assert!(err.to_string().contains("connection refused"));
    }
}
