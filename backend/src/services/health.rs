use async_trait::async_trait;
use bb8_redis::redis;

use crate::db::redis::RedisPool;

/// Liveness check of the cache store backing history, tokens and metrics.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheProbe: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
}

pub struct RedisCacheProbe {
    pool: RedisPool,
}

impl RedisCacheProbe {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheProbe for RedisCacheProbe {
    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let reply: String = redis::cmd("PING").query_async(&mut *conn).await?;
        if reply != "PONG" {
            anyhow::bail!("unexpected PING reply: {}", reply);
        }
        Ok(())
    }
}
