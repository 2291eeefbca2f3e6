//! Response quality and latency records exposed by the metrics endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Measurements taken for one successful chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub latency_seconds: f64,
    pub response_length_words: usize,
    /// Cosine similarity between the query and response embeddings.
    pub query_response_relevance: Option<f32>,
    /// Cosine similarity between the retrieved context and the response.
    pub context_relevance: Option<f32>,
    /// Word count of query plus response, used as a cost proxy.
    pub token_count: usize,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
}

/// Running aggregates across every turn served by this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub success_rate: f64,
    pub avg_latency: Option<f64>,
    pub p50_latency: Option<f64>,
    pub p95_latency: Option<f64>,
    pub p99_latency: Option<f64>,
    pub avg_context_relevance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetricsSummary {
    pub total_interactions: usize,
    pub avg_latency: f64,
    pub avg_relevance_score: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Stored per-turn metrics for one session, newest first, with a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: SessionId,
    pub metrics: Vec<ResponseMetrics>,
    pub summary: SessionMetricsSummary,
}

impl SessionMetrics {
    /// Builds the read-back for a session; `None` when nothing was recorded.
    pub fn summarize(session_id: SessionId, metrics: Vec<ResponseMetrics>) -> Option<Self> {
        let start_time = metrics.iter().map(|m| m.timestamp).min()?;
        let end_time = metrics.iter().map(|m| m.timestamp).max()?;
        let count = metrics.len();
        let avg_latency = metrics.iter().map(|m| m.latency_seconds).sum::<f64>() / count as f64;
        // Turns without a relevance score count as zero.
        let avg_relevance_score = metrics
            .iter()
            .map(|m| m.query_response_relevance.unwrap_or(0.0) as f64)
            .sum::<f64>()
            / count as f64;

        Some(Self {
            session_id,
            metrics,
            summary: SessionMetricsSummary {
                total_interactions: count,
                avg_latency,
                avg_relevance_score,
                start_time,
                end_time,
            },
        })
    }
}
