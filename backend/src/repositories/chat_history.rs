//! Per-session, append-only chat history log kept in the cache store.

use async_trait::async_trait;
use bb8_redis::redis::{self, AsyncCommands};
use tracing::Instrument;

use crate::db::redis::RedisPool;
use crate::types::{SessionId, UserId};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Append lines to the end of the session log, in order.
    async fn append(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        lines: Vec<String>,
    ) -> anyhow::Result<()>;

    /// The most recent `limit` lines, oldest first.
    async fn recent(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;
}

pub fn history_key(user_id: UserId, session_id: &SessionId) -> String {
    format!("chat_history:{}:{}", user_id, session_id)
}

pub struct RedisChatHistoryStore {
    pool: RedisPool,
}

impl RedisChatHistoryStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatHistoryStore for RedisChatHistoryStore {
    async fn append(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        lines: Vec<String>,
    ) -> anyhow::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let span = tracing::debug_span!("redis_history_append", %user_id, %session_id);
        async {
            let mut conn = self.pool.get().await?;
            redis::pipe()
                .atomic()
                .rpush(history_key(user_id, session_id), lines)
                .query_async::<_, ()>(&mut *conn)
                .await?;
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await
    }

    async fn recent(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let span = tracing::debug_span!("redis_history_recent", %user_id, %session_id, limit);
        async {
            let mut conn = self.pool.get().await?;
            let start = -(limit.min(isize::MAX as usize) as isize);
            let lines: Vec<String> = conn
                .lrange(history_key(user_id, session_id), start, -1)
                .await?;
            Ok::<_, anyhow::Error>(lines)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_key_scopes_by_user_and_session() {
        let user = UserId::new();
        let session = SessionId::parse("abc").unwrap();
        assert_eq!(
            history_key(user, &session),
            format!("chat_history:{}:abc", user)
        );
    }
}
