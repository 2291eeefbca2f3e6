//! The per-message chat turn: retrieve context, generate, then persist.
//!
//! A turn is split in two so the caller can send the reply before the
//! write-back runs: [`TurnPipeline::respond`] does steps that shape the reply,
//! [`TurnPipeline::persist`] does the history/vector/metrics writes.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::Config;
use crate::error::UpstreamError;
use crate::models::chat::ChatTurn;
use crate::models::metrics::ResponseMetrics;
use crate::repositories::{ChatHistoryStore, VectorMetadata, VectorRecord, VectorStore};
use crate::services::llm::{Embedder, Generator, SamplingConfig};
use crate::services::metrics::MetricsCollector;
use crate::types::{SessionId, UserId};
use crate::utils::similarity::{cosine_similarity, word_count};
use crate::utils::token::fingerprint;

/// Reply sent whenever embedding or generation fails.
pub const FALLBACK_REPLY: &str = "I'm sorry, I encountered an error processing your request.";

/// Context used when the vector index has nothing for the session.
pub const NO_CONTEXT: &str = "No context found.";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_k: usize,
    pub history_limit: usize,
    pub sampling: SamplingConfig,
    pub upstream_timeout: Duration,
    /// Bound on the embedding calls made only to score a reply.
    pub metrics_timeout: Duration,
    pub metrics_enabled: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            history_limit: 10,
            sampling: SamplingConfig::default(),
            upstream_timeout: Duration::from_secs(30),
            metrics_timeout: Duration::from_secs(5),
            metrics_enabled: true,
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            top_k: config.retrieval_top_k,
            history_limit: config.history_limit,
            sampling: SamplingConfig::from(config),
            upstream_timeout: config.upstream_timeout(),
            metrics_timeout: config.metrics_timeout(),
            metrics_enabled: config.metrics_enabled,
        }
    }
}

/// Outcome of the reply-shaping half of a turn.
#[derive(Debug, Clone)]
pub enum TurnReply {
    Answered(AnsweredTurn),
    Fallback,
}

#[derive(Debug, Clone)]
pub struct AnsweredTurn {
    pub turn: ChatTurn,
    pub query_embedding: Vec<f32>,
    pub context: String,
    pub latency: Duration,
}

impl TurnReply {
    pub fn text(&self) -> &str {
        match self {
            TurnReply::Answered(answered) => &answered.turn.assistant,
            TurnReply::Fallback => FALLBACK_REPLY,
        }
    }
}

pub struct TurnPipeline {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    vectors: Arc<dyn VectorStore>,
    history: Arc<dyn ChatHistoryStore>,
    metrics: MetricsCollector,
    settings: PipelineSettings,
}

impl TurnPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        vectors: Arc<dyn VectorStore>,
        history: Arc<dyn ChatHistoryStore>,
        metrics: MetricsCollector,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            embedder,
            generator,
            vectors,
            history,
            metrics,
            settings,
        }
    }

    /// Runs a whole turn and returns the reply text.
    pub async fn run(&self, user_id: UserId, session_id: &SessionId, utterance: &str) -> String {
        let reply = self.respond(user_id, session_id, utterance).await;
        self.persist(user_id, session_id, &reply).await;
        reply.text().to_string()
    }

    pub async fn respond(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        utterance: &str,
    ) -> TurnReply {
        let started = Instant::now();

        let query_embedding = match self
            .bounded("embedding", self.embedder.embed(utterance))
            .await
        {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!(%user_id, %session_id, error = %err, "Embedding failed");
                return TurnReply::Fallback;
            }
        };

        let context = self.retrieve_context(session_id, &query_embedding).await;
        let history = self.recent_history(user_id, session_id).await;
        let prompt = compose_prompt(&context, &history, utterance);

        let sampling = self.settings.sampling;
        let assistant = match self
            .bounded("generation", self.generator.generate(&prompt, &sampling))
            .await
        {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(%user_id, %session_id, error = %err, "Generation failed");
                return TurnReply::Fallback;
            }
        };

        TurnReply::Answered(AnsweredTurn {
            turn: ChatTurn::new(utterance, assistant),
            query_embedding,
            context,
            latency: started.elapsed(),
        })
    }

    /// Writes an answered turn back to history, the vector index and metrics.
    ///
    /// Every failure is logged and dropped.
    pub async fn persist(&self, user_id: UserId, session_id: &SessionId, reply: &TurnReply) {
        let answered = match reply {
            TurnReply::Answered(answered) => answered,
            TurnReply::Fallback => {
                if self.settings.metrics_enabled {
                    self.metrics.record_failure();
                }
                return;
            }
        };
        let turn = &answered.turn;

        let lines = turn.history_lines().to_vec();
        if let Err(err) = self
            .bounded("chat history", self.history.append(user_id, session_id, lines))
            .await
        {
            tracing::warn!(%user_id, %session_id, error = %err, "Failed to append chat history");
        }

        if let Err(err) = self.index_turn(session_id, turn).await {
            tracing::warn!(%user_id, %session_id, error = %err, "Failed to index chat turn");
        }

        if self.settings.metrics_enabled {
            let metrics = self.evaluate(session_id, answered).await;
            self.metrics.record_success(metrics).await;
        }
    }

    async fn retrieve_context(&self, session_id: &SessionId, query_embedding: &[f32]) -> String {
        let matches = match self
            .bounded(
                "vector index",
                self.vectors
                    .query(query_embedding.to_vec(), self.settings.top_k, session_id),
            )
            .await
        {
            Ok(matches) => matches,
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "Context retrieval failed");
                return NO_CONTEXT.to_string();
            }
        };

        let texts: Vec<String> = matches
            .into_iter()
            .filter(|m| m.session_id == session_id.as_str())
            .map(|m| m.text)
            .collect();
        if texts.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            texts.join(" ")
        }
    }

    async fn recent_history(&self, user_id: UserId, session_id: &SessionId) -> String {
        match self
            .bounded(
                "chat history",
                self.history
                    .recent(user_id, session_id, self.settings.history_limit),
            )
            .await
        {
            Ok(lines) => lines.join("\n"),
            Err(err) => {
                tracing::warn!(%user_id, %session_id, error = %err, "History lookup failed");
                String::new()
            }
        }
    }

    async fn index_turn(&self, session_id: &SessionId, turn: &ChatTurn) -> anyhow::Result<()> {
        let text = turn.combined_text();
        let values = self
            .bounded("embedding", self.embedder.embed(&text))
            .await?;
        let record = VectorRecord {
            id: fingerprint(&[&text, session_id.as_str()]),
            values,
            metadata: VectorMetadata {
                text,
                session_id: session_id.to_string(),
            },
        };
        self.bounded("vector index", self.vectors.upsert(record))
            .await
    }

    /// Scores an answered turn. Both embeddings run together under
    /// `metrics_timeout`, so scoring never holds the next turn longer than that.
    async fn evaluate(&self, session_id: &SessionId, answered: &AnsweredTurn) -> ResponseMetrics {
        let turn = &answered.turn;
        let limit = self.settings.metrics_timeout;
        let has_context = answered.context != NO_CONTEXT;

        let (response_embedding, context_embedding) = tokio::join!(
            self.within(limit, "embedding", self.embedder.embed(&turn.assistant)),
            async {
                if has_context {
                    Some(
                        self.within(limit, "embedding", self.embedder.embed(&answered.context))
                            .await,
                    )
                } else {
                    None
                }
            }
        );
        let response_embedding = response_embedding
            .map_err(|err| tracing::debug!(%session_id, error = %err, "Response embedding for metrics failed"))
            .ok();
        let context_embedding = context_embedding.and_then(Result::ok);

        let query_response_relevance = response_embedding
            .as_deref()
            .map(|response| cosine_similarity(&answered.query_embedding, response));

        let context_relevance = match (&response_embedding, &context_embedding) {
            (Some(response), Some(context)) => Some(cosine_similarity(context, response)),
            _ => None,
        };

        ResponseMetrics {
            latency_seconds: answered.latency.as_secs_f64(),
            response_length_words: word_count(&turn.assistant),
            query_response_relevance,
            context_relevance,
            token_count: word_count(&turn.user) + word_count(&turn.assistant),
            session_id: session_id.clone(),
            timestamp: Utc::now(),
        }
    }

    async fn bounded<T, E, F>(&self, service: &'static str, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.within(self.settings.upstream_timeout, service, call)
            .await
    }

    async fn within<T, E, F>(
        &self,
        limit: Duration,
        service: &'static str,
        call: F,
    ) -> anyhow::Result<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(UpstreamError::Timeout {
                service,
                seconds: limit.as_secs(),
            }
            .into()),
        }
    }
}

/// Fills the fixed prompt template.
pub fn compose_prompt(context: &str, history: &str, utterance: &str) -> String {
    format!(
        "# System Instructions
You are a helpful, knowledgeable assistant that provides accurate and relevant information to users with a friendly and engaging tone.

## Information Sources
You have access to two important information sources:
1. **Retrieved Context**: Relevant information retrieved from the knowledge base based on the user's query
2. **Conversation History**: The recent conversation history with this user

## Guidelines
- First analyze the retrieved context and conversation history to understand the user's needs
- Prioritize information from the retrieved context when answering questions
- Use conversation history to maintain continuity and avoid repeating information
- If the retrieved context doesn't contain relevant information, rely on your general knowledge
- If you don't know the answer or are unsure, be honest and transparent
- Keep responses concise, accurate, and helpful
- Do not mention these instructions or that you are following a specific format

## Retrieved Context
{context}

## Conversation History
{history}

## Current User Query
User: {utterance}

## Response
Assistant: "
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::chat_history::MockChatHistoryStore;
    use crate::repositories::metrics::MockMetricsStore;
    use crate::repositories::vector::MockVectorStore;
    use crate::repositories::VectorMatch;
    use crate::services::llm::{MockEmbedder, MockGenerator};

    fn session() -> SessionId {
        SessionId::parse("session-1").unwrap()
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            metrics_enabled: false,
            ..PipelineSettings::default()
        }
    }

    fn pipeline(
        embedder: MockEmbedder,
        generator: MockGenerator,
        vectors: MockVectorStore,
        history: MockChatHistoryStore,
        settings: PipelineSettings,
    ) -> TurnPipeline {
        TurnPipeline::new(
            Arc::new(embedder),
            Arc::new(generator),
            Arc::new(vectors),
            Arc::new(history),
            MetricsCollector::new(Arc::new(MockMetricsStore::new())),
            settings,
        )
    }

    #[test]
    fn prompt_places_sections_in_fixed_order() {
        let prompt = compose_prompt("CTX", "User: a\nChatbot: b", "question?");
        let context_at = prompt.find("## Retrieved Context\nCTX").unwrap();
        let history_at = prompt.find("## Conversation History\nUser: a\nChatbot: b").unwrap();
        let query_at = prompt.find("## Current User Query\nUser: question?").unwrap();
        assert!(prompt.starts_with("# System Instructions"));
        assert!(context_at < history_at && history_at < query_at);
        assert!(prompt.ends_with("Assistant: "));
    }

    #[tokio::test]
    async fn embedding_failure_returns_fallback_and_touches_nothing() {
        let mut embedder = MockEmbedder::new();
        embedder
            .expect_embed()
            .returning(|_| Err(UpstreamError::payload("embedding", "boom")));
        let mut generator = MockGenerator::new();
        generator.expect_generate().never();
        let mut vectors = MockVectorStore::new();
        vectors.expect_query().never();
        vectors.expect_upsert().never();
        let mut history = MockChatHistoryStore::new();
        history.expect_append().never();
        history.expect_recent().never();

        let pipeline = pipeline(embedder, generator, vectors, history, settings());
        let reply = pipeline.run(UserId::new(), &session(), "hi").await;
        assert_eq!(reply, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn context_joins_matches_in_service_order_and_drops_foreign_sessions() {
        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().returning(|_| Ok(vec![1.0, 0.0]));
        let mut vectors = MockVectorStore::new();
        vectors
            .expect_query()
            .withf(|_, top_k, session_id| *top_k == 5 && session_id.as_str() == "session-1")
            .returning(|_, _, _| {
                Ok(vec![
                    VectorMatch {
                        id: "1".into(),
                        score: 0.9,
                        text: "first".into(),
                        session_id: "session-1".into(),
                    },
                    VectorMatch {
                        id: "2".into(),
                        score: 0.8,
                        text: "leaked".into(),
                        session_id: "other".into(),
                    },
                    VectorMatch {
                        id: "3".into(),
                        score: 0.7,
                        text: "second".into(),
                        session_id: "session-1".into(),
                    },
                ])
            });
        let mut history = MockChatHistoryStore::new();
        history
            .expect_recent()
            .withf(|_, _, limit| *limit == 10)
            .returning(|_, _, _| Err(anyhow::anyhow!("redis down")));
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .withf(|prompt, _| {
                prompt.contains("## Retrieved Context\nfirst second\n")
                    && !prompt.contains("leaked")
                    && prompt.contains("## Conversation History\n\n")
            })
            .returning(|_, _| Ok("answer".into()));

        let pipeline = pipeline(embedder, generator, vectors, history, settings());
        let reply = pipeline.respond(UserId::new(), &session(), "q").await;
        assert_eq!(reply.text(), "answer");
    }

    #[tokio::test]
    async fn vector_query_failure_degrades_to_sentinel_context() {
        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().returning(|_| Ok(vec![1.0]));
        let mut vectors = MockVectorStore::new();
        vectors.expect_query().returning(|_, _, _| {
            Err(UpstreamError::Status {
                service: "vector index",
                status: 500,
                body: String::new(),
            })
        });
        let mut history = MockChatHistoryStore::new();
        history.expect_recent().returning(|_, _, _| Ok(Vec::new()));
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .withf(|prompt, _| prompt.contains(NO_CONTEXT))
            .returning(|_, _| Ok("ok".into()));

        let pipeline = pipeline(embedder, generator, vectors, history, settings());
        let reply = pipeline.respond(UserId::new(), &session(), "q").await;
        assert!(matches!(reply, TurnReply::Answered(_)));
    }

    #[tokio::test]
    async fn generation_failure_skips_all_writes() {
        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().times(1).returning(|_| Ok(vec![1.0]));
        let mut vectors = MockVectorStore::new();
        vectors.expect_query().returning(|_, _, _| Ok(Vec::new()));
        vectors.expect_upsert().never();
        let mut history = MockChatHistoryStore::new();
        history.expect_recent().returning(|_, _, _| Ok(Vec::new()));
        history.expect_append().never();
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .returning(|_, _| Err(UpstreamError::payload("generation", "empty completion")));

        let pipeline = pipeline(embedder, generator, vectors, history, settings());
        let reply = pipeline.run(UserId::new(), &session(), "q").await;
        assert_eq!(reply, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn slow_generation_times_out_to_fallback() {
        struct SlowGenerator;

        #[async_trait::async_trait]
        impl Generator for SlowGenerator {
            async fn generate(&self, _: &str, _: &SamplingConfig) -> Result<String, UpstreamError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("too late".into())
            }
        }

        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().returning(|_| Ok(vec![1.0]));
        let mut vectors = MockVectorStore::new();
        vectors.expect_query().returning(|_, _, _| Ok(Vec::new()));
        let mut history = MockChatHistoryStore::new();
        history.expect_recent().returning(|_, _, _| Ok(Vec::new()));
        history.expect_append().never();

        let pipeline = TurnPipeline::new(
            Arc::new(embedder),
            Arc::new(SlowGenerator),
            Arc::new(vectors),
            Arc::new(history),
            MetricsCollector::new(Arc::new(MockMetricsStore::new())),
            PipelineSettings {
                upstream_timeout: Duration::from_millis(50),
                ..settings()
            },
        );
        let reply = pipeline.run(UserId::new(), &session(), "q").await;
        assert_eq!(reply, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn successful_turn_persists_history_and_vector_entry() {
        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().returning(|_| Ok(vec![0.5, 0.5]));
        let mut vectors = MockVectorStore::new();
        vectors.expect_query().returning(|_, _, _| Ok(Vec::new()));
        vectors
            .expect_upsert()
            .withf(|record| {
                record.metadata.text == "hellohi there"
                    && record.metadata.session_id == "session-1"
                    && record.id == fingerprint(&["hellohi there", "session-1"])
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut history = MockChatHistoryStore::new();
        history.expect_recent().returning(|_, _, _| Ok(Vec::new()));
        history
            .expect_append()
            .withf(|_, _, lines| {
                lines == &vec!["User: hello".to_string(), "Chatbot: hi there".to_string()]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .returning(|_, _| Ok("hi there".into()));

        let pipeline = pipeline(embedder, generator, vectors, history, settings());
        let reply = pipeline.run(UserId::new(), &session(), "hello").await;
        assert_eq!(reply, "hi there");
    }

    #[tokio::test]
    async fn persistence_failures_do_not_change_reply() {
        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().returning(|_| Ok(vec![1.0]));
        let mut vectors = MockVectorStore::new();
        vectors.expect_query().returning(|_, _, _| Ok(Vec::new()));
        vectors.expect_upsert().returning(|_| {
            Err(UpstreamError::Status {
                service: "vector index",
                status: 503,
                body: String::new(),
            })
        });
        let mut history = MockChatHistoryStore::new();
        history.expect_recent().returning(|_, _, _| Ok(Vec::new()));
        history
            .expect_append()
            .returning(|_, _, _| Err(anyhow::anyhow!("redis down")));
        let mut generator = MockGenerator::new();
        generator.expect_generate().returning(|_, _| Ok("fine".into()));

        let pipeline = pipeline(embedder, generator, vectors, history, settings());
        assert_eq!(pipeline.run(UserId::new(), &session(), "q").await, "fine");
    }

    #[tokio::test]
    async fn metrics_record_relevance_for_answered_turns() {
        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().returning(|_| Ok(vec![1.0, 0.0]));
        let mut vectors = MockVectorStore::new();
        vectors.expect_query().returning(|_, _, _| Ok(Vec::new()));
        vectors.expect_upsert().returning(|_| Ok(()));
        let mut history = MockChatHistoryStore::new();
        history.expect_recent().returning(|_, _, _| Ok(Vec::new()));
        history.expect_append().returning(|_, _, _| Ok(()));
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .returning(|_, _| Ok("two words".into()));
        let mut store = MockMetricsStore::new();
        store
            .expect_push()
            .withf(|m| {
                m.query_response_relevance == Some(1.0)
                    && m.context_relevance.is_none()
                    && m.response_length_words == 2
                    && m.token_count == 3
            })
            .times(1)
            .returning(|_| Ok(()));
        let collector = MetricsCollector::new(Arc::new(store));

        let pipeline = TurnPipeline::new(
            Arc::new(embedder),
            Arc::new(generator),
            Arc::new(vectors),
            Arc::new(history),
            collector.clone(),
            PipelineSettings::default(),
        );
        pipeline.run(UserId::new(), &session(), "query").await;
        assert_eq!(collector.snapshot().successful_requests, 1);
    }

    #[tokio::test]
    async fn slow_scoring_embeddings_are_cut_off_by_metrics_timeout() {
        struct SlowOnReply;

        #[async_trait::async_trait]
        impl Embedder for SlowOnReply {
            async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
                if text == "slow answer" || text == "earlier turn" {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(vec![1.0, 0.0])
            }
        }

        let mut vectors = MockVectorStore::new();
        vectors.expect_query().returning(|_, _, _| {
            Ok(vec![VectorMatch {
                id: "1".into(),
                score: 0.9,
                text: "earlier turn".into(),
                session_id: "session-1".into(),
            }])
        });
        vectors.expect_upsert().times(1).returning(|_| Ok(()));
        let mut history = MockChatHistoryStore::new();
        history.expect_recent().returning(|_, _, _| Ok(Vec::new()));
        history.expect_append().times(1).returning(|_, _, _| Ok(()));
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .returning(|_, _| Ok("slow answer".into()));
        let mut store = MockMetricsStore::new();
        store
            .expect_push()
            .withf(|m| m.query_response_relevance.is_none() && m.context_relevance.is_none())
            .times(1)
            .returning(|_| Ok(()));
        let collector = MetricsCollector::new(Arc::new(store));

        let pipeline = TurnPipeline::new(
            Arc::new(SlowOnReply),
            Arc::new(generator),
            Arc::new(vectors),
            Arc::new(history),
            collector.clone(),
            PipelineSettings {
                upstream_timeout: Duration::from_secs(10),
                metrics_timeout: Duration::from_millis(50),
                ..PipelineSettings::default()
            },
        );

        let started = Instant::now();
        let reply = pipeline.run(UserId::new(), &session(), "q").await;
        assert_eq!(reply, "slow answer");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(collector.snapshot().successful_requests, 1);
    }
}
