use crate::db::redis::RedisPool;
use crate::types::UserId;
use crate::utils::token::fingerprint;
use async_trait::async_trait;
use bb8_redis::redis::{self, AsyncCommands};
use tracing::Instrument;

/// Server-side table mapping opaque access tokens to user ids.
///
/// Expiry is owned by the store: a token that has outlived its TTL resolves
/// to `None` exactly like one that was never issued.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn register(&self, token: &str, user_id: UserId, ttl_seconds: u64) -> anyhow::Result<()>;
    async fn resolve(&self, token: &str) -> anyhow::Result<Option<UserId>>;
}

pub struct RedisTokenStore {
    pool: RedisPool,
}

impl RedisTokenStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    pub fn token_key(token: &str) -> String {
        format!("access_token:{}", fingerprint(&[token]))
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn register(&self, token: &str, user_id: UserId, ttl_seconds: u64) -> anyhow::Result<()> {
        let span = tracing::debug_span!("redis_register_token", %user_id);
        async {
            let mut conn = self.pool.get().await?;
            redis::pipe()
                .set_ex(Self::token_key(token), user_id.to_string(), ttl_seconds)
                .query_async::<_, ()>(&mut *conn)
                .await?;
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await
    }

    async fn resolve(&self, token: &str) -> anyhow::Result<Option<UserId>> {
        let span = tracing::debug_span!("redis_resolve_token");
        let stored: Option<String> = async {
            let mut conn = self.pool.get().await?;
            let stored: Option<String> = conn.get(Self::token_key(token)).await?;
            Ok::<_, anyhow::Error>(stored)
        }
        .instrument(span)
        .await?;

        // A value that is not a user id is treated as an unknown token.
        Ok(stored.and_then(|raw| raw.parse().ok()))
    }
}
