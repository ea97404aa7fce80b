//! Redis adapter for the dedup lock and cooldown keys.
//!
//! Locks are released with a compare-and-delete script so only the holder
//! that set a lock's token can remove it.

use async_trait::async_trait;
use facegate_core::{KeyValueStore, StoreError};
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

/// Delete KEYS[1] only if it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Lock/cooldown keys in Redis. The connection manager reconnects on its own.
#[derive(Clone)]
pub struct RedisKeyStore {
    conn: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisKeyStore {
    /// Connect and verify the server answers `PING`. Fails fast at startup.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(reply = %pong, "redis connected");
        Ok(Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Redis `EX` takes whole seconds; never round a live key down to zero.
fn seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyValueStore for RedisKeyStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("EX")
            .arg(seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }
}
