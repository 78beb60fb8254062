//! Redis window store for `floodgate` (companion crate).
//!
//! Each key is a sorted set of event timestamps. A whole admission decision runs as one Lua
//! script, so pruning, counting and recording cannot interleave between callers, including
//! callers in other processes sharing the same Redis.
//!
//! ```no_run
//! use floodgate::{RateLimiter, SlidingWindow};
//! use floodgate_redis::RedisWindowStore;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisWindowStore::connect("redis://127.0.0.1/").await?;
//! let limiter = SlidingWindow::new(store, 100, Duration::from_secs(60))?;
//! let decision = limiter.check("ip:203.0.113.7").await;
//! # let _ = decision;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use floodgate::store::{WindowOutcome, WindowStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::sync::Arc;
use std::time::Duration;

/// Prune, count, then record if below the limit.
///
/// KEYS[1] = window key; ARGV = now_millis, window_millis, limit, member.
/// Returns `{admitted (0|1), count, oldest_millis (-1 when empty)}`.
const RECORD_IF_BELOW: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  count = count + 1
  admitted = 1
end

local oldest = -1
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if first[2] then
  oldest = tonumber(first[2])
end
return {admitted, count, oldest}
"#;

/// [`WindowStore`] backed by Redis sorted sets.
///
/// Cloning is cheap; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
    script: Arc<Script>,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore").field("script", &self.script.get_hash()).finish()
    }
}

impl RedisWindowStore {
    /// Connect to `url` with an auto-reconnecting connection manager.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::debug!(target: "floodgate::redis", "window store connected");
        Ok(Self::from_manager(conn))
    }

    /// Use an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn, script: Arc::new(Script::new(RECORD_IF_BELOW)) }
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

fn outcome(admitted: i64, count: i64, oldest: i64) -> WindowOutcome {
    WindowOutcome {
        admitted: admitted == 1,
        count: u32::try_from(count.max(0)).unwrap_or(u32::MAX),
        oldest_millis: u64::try_from(oldest).ok(),
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    type Error = RedisError;

    async fn record_if_below(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
        limit: u32,
    ) -> Result<WindowOutcome, Self::Error> {
        // Members must be unique or same-millisecond events would collapse into one.
        let member = format!("{}-{}", now_millis, uuid::Uuid::new_v4());
        let mut conn = self.conn.clone();
        let (admitted, count, oldest): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(now_millis)
            .arg(window_millis(window))
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome(admitted, count, oldest))
    }

    async fn clear(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
