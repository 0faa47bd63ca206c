//! `timecapsule-redis` — the Redis sorted-set transport.
//!
//! Capsules live in one sorted set: score = due-time in epoch milliseconds,
//! member = the sealed capsule string. The command mapping is:
//!
//! | Primitive        | Redis command                          |
//! |------------------|----------------------------------------|
//! | insert           | `ZADD key score member`                |
//! | any_due          | `ZRANGEBYSCORE key 0 now LIMIT 0 1`    |
//! | pop_min          | `ZPOPMIN key 1`                        |
//! | remove           | `ZREM key member`                      |
//! | clear            | `DEL key`                              |
//!
//! `ZPOPMIN` is the transport's atomic pop: concurrent diggers on any number
//! of processes or machines each receive a given entry at most once.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use async_trait::async_trait;
use timecapsule_core::{Backend, CapsuleError, CapsuleStore, Result};

/// A [`CapsuleStore`] over the Redis transport.
pub type RedisStore<P> = CapsuleStore<P, RedisBackend>;

/// The Redis transport: one auto-reconnecting multiplexed connection and
/// the sorted-set key it operates on.
///
/// Clones share the multiplexed connection; build several stores over clones
/// of one backend to let several diggers poll the same queue. The connection
/// is an injected, explicitly owned handle — construct it once at startup
/// and pass it in, rather than reaching for process-global state.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    key: String,
}

impl RedisBackend {
    /// A backend over an existing connection handle.
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    /// Connect to `url` and operate on the sorted set at `key`.
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(transport)?;
        let conn = ConnectionManager::new(client).await.map_err(transport)?;
        debug!(url, "connected to redis");
        Ok(Self::new(conn, key))
    }

    /// The sorted-set key this backend operates on.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

// Replies are typed as collections throughout, so an empty reply (Redis nil)
// surfaces as an empty Vec rather than an error — the "not found means
// absent, not failure" rule falls out of the types.
#[async_trait]
impl Backend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn insert(&self, score: i64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(&self.key, member, score)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn any_due(&self, max_score: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        // One member is enough to answer the existence probe.
        let due: Vec<String> = conn
            .zrangebyscore_limit(&self.key, 0i64, max_score, 0, 1)
            .await
            .map_err(transport)?;
        Ok(!due.is_empty())
    }

    async fn pop_min(&self) -> Result<Option<(i64, String)>> {
        let mut conn = self.conn.clone();
        let mut popped: Vec<(String, f64)> =
            conn.zpopmin(&self.key, 1).await.map_err(transport)?;
        Ok(popped.pop().map(|(member, score)| (score as i64, member)))
    }

    async fn remove(&self, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        // ZREM reports how many members were removed; zero (already absent)
        // is success.
        let removed: i64 = conn.zrem(&self.key, member).await.map_err(transport)?;
        debug!(key = %self.key, removed, "zrem");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(&self.key).await.map_err(transport)?;
        Ok(())
    }
}

fn transport(e: redis::RedisError) -> CapsuleError {
    CapsuleError::Transport(e.to_string())
}
