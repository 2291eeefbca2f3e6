//! Best-effort response metrics: in-process aggregates plus a per-session log.
//!
//! Nothing here may influence a chat turn. Store failures are logged and
//! dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::metrics::{AggregateMetrics, ResponseMetrics, SessionMetrics};
use crate::repositories::MetricsStore;
use crate::types::SessionId;
use crate::utils::similarity::{mean, percentile};

/// Latency percentiles are computed over this many most recent turns.
const LATENCY_WINDOW: usize = 10_000;

#[derive(Default)]
struct Aggregates {
    total_requests: u64,
    successful_requests: u64,
    latencies: VecDeque<f64>,
    context_relevance_sum: f64,
    context_relevance_count: u64,
}

#[derive(Clone)]
pub struct MetricsCollector {
    aggregates: Arc<Mutex<Aggregates>>,
    store: Arc<dyn MetricsStore>,
}

impl MetricsCollector {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self {
            aggregates: Arc::new(Mutex::new(Aggregates::default())),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Aggregates> {
        self.aggregates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts a turn that ended with the fallback reply.
    pub fn record_failure(&self) {
        self.lock().total_requests += 1;
    }

    /// Counts a successful turn and appends it to the session log.
    pub async fn record_success(&self, metrics: ResponseMetrics) {
        {
            let mut agg = self.lock();
            agg.total_requests += 1;
            agg.successful_requests += 1;
            if agg.latencies.len() == LATENCY_WINDOW {
                agg.latencies.pop_front();
            }
            agg.latencies.push_back(metrics.latency_seconds);
            if let Some(score) = metrics.context_relevance {
                agg.context_relevance_sum += score as f64;
                agg.context_relevance_count += 1;
            }
        }

        if let Err(err) = self.store.push(&metrics).await {
            tracing::warn!(
                session_id = %metrics.session_id,
                error = %err,
                "Failed to store response metrics"
            );
        }
    }

    pub fn snapshot(&self) -> AggregateMetrics {
        let (total, successful, mut latencies, relevance_sum, relevance_count) = {
            let agg = self.lock();
            (
                agg.total_requests,
                agg.successful_requests,
                agg.latencies.iter().copied().collect::<Vec<f64>>(),
                agg.context_relevance_sum,
                agg.context_relevance_count,
            )
        };
        latencies.sort_by(|a, b| a.total_cmp(b));

        AggregateMetrics {
            total_requests: total,
            successful_requests: successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            avg_latency: mean(&latencies),
            p50_latency: percentile(&latencies, 50.0),
            p95_latency: percentile(&latencies, 95.0),
            p99_latency: percentile(&latencies, 99.0),
            avg_context_relevance: (relevance_count > 0)
                .then(|| relevance_sum / relevance_count as f64),
        }
    }

    /// Stored metrics for one session, `None` when nothing was recorded.
    pub async fn session(&self, session_id: &SessionId) -> anyhow::Result<Option<SessionMetrics>> {
        let entries = self.store.list(session_id).await?;
        Ok(SessionMetrics::summarize(session_id.clone(), entries))
    }
}
