//! Per-session metrics log kept in the cache store.

use async_trait::async_trait;
use bb8_redis::redis::{self, AsyncCommands};
use tracing::Instrument;

use crate::db::redis::RedisPool;
use crate::models::metrics::ResponseMetrics;
use crate::types::SessionId;

/// Session metric logs expire after 30 days.
pub const METRICS_TTL_SECONDS: i64 = 60 * 60 * 24 * 30;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Prepend one entry to the session's log and refresh its expiry.
    async fn push(&self, metrics: &ResponseMetrics) -> anyhow::Result<()>;

    /// All entries for a session, newest first.
    async fn list(&self, session_id: &SessionId) -> anyhow::Result<Vec<ResponseMetrics>>;
}

pub fn metrics_key(session_id: &SessionId) -> String {
    format!("response_metrics:{}", session_id)
}

pub struct RedisMetricsStore {
    pool: RedisPool,
}

impl RedisMetricsStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsStore for RedisMetricsStore {
    async fn push(&self, metrics: &ResponseMetrics) -> anyhow::Result<()> {
        let payload = serde_json::to_string(metrics)?;
        let key = metrics_key(&metrics.session_id);
        let span = tracing::debug_span!("redis_metrics_push", session_id = %metrics.session_id);
        async {
            let mut conn = self.pool.get().await?;
            redis::pipe()
                .atomic()
                .lpush(&key, payload)
                .expire(&key, METRICS_TTL_SECONDS)
                .query_async::<_, ()>(&mut *conn)
                .await?;
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await
    }

    async fn list(&self, session_id: &SessionId) -> anyhow::Result<Vec<ResponseMetrics>> {
        let span = tracing::debug_span!("redis_metrics_list", %session_id);
        let raw: Vec<String> = async {
            let mut conn = self.pool.get().await?;
            let raw: Vec<String> = conn.lrange(metrics_key(session_id), 0, -1).await?;
            Ok::<_, anyhow::Error>(raw)
        }
        .instrument(span)
        .await?;

        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(anyhow::Error::from))
            .collect()
    }
}
