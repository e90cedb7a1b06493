//! Redis-backed key-value store.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::info;

use super::{CacheFuture, KeyValueStore, ttl_millis};
use crate::error::CacheError;

/// Deletes `KEYS[1]` only while it still holds `ARGV[1]`.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Key-value store backed by a Redis server.
///
/// The connection manager reconnects transparently and is cheap to clone, so
/// each operation works on its own handle.
#[derive(Clone)]
pub struct RedisKeyValue {
    manager: ConnectionManager,
}

impl RedisKeyValue {
    /// Connect to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` when the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(connection_failed)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(connection_failed)?;
        info!("connected to key-value cache");
        Ok(Self { manager })
    }
}

fn connection_failed(error: RedisError) -> CacheError {
    CacheError::ConnectionFailed {
        message: error.to_string(),
    }
}

fn command_failed(command: &'static str) -> impl FnOnce(RedisError) -> CacheError {
    move |error| CacheError::CommandFailed {
        command,
        message: error.to_string(),
    }
}

impl KeyValueStore for RedisKeyValue {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(command_failed("GET"))?;
            Ok(value)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(command_failed("SET"))?;
            Ok(())
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, bool> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(command_failed("SET NX"))?;
            Ok(reply.is_some())
        })
    }

    fn increment<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, u64> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .cmd("INCR")
                .arg(key)
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(command_failed("INCR"))?;
            Ok(count)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _removed: u64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(command_failed("DEL"))?;
            Ok(())
        })
    }

    fn delete_if_equals<'a>(&'a self, key: &'a str, expected: &'a str) -> CacheFuture<'a, bool> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let removed: u64 = Script::new(COMPARE_AND_DELETE)
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(command_failed("EVALSHA"))?;
            Ok(removed > 0)
        })
    }
}
