#![allow(dead_code)]
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::Router;
use shashtra_backend::{
    config::Config,
    error::UpstreamError,
    models::{metrics::ResponseMetrics, user::User},
    repositories::{
        ChatHistoryStore, MetricsStore, UserStore, VectorMatch, VectorRecord, VectorStore,
    },
    routes::build_router,
    services::{
        AuthService, CacheProbe, Embedder, Generator, MetricsCollector, PipelineSettings,
        SamplingConfig, TokenStore, TurnPipeline,
    },
    state::AppState,
    types::{SessionId, UserId},
    utils::token::generate_access_token,
};

pub fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".parse().expect("bind addr"),
        database_url: "postgres://unused".into(),
        redis_url: "redis://unused".into(),
        redis_pool_size: 1,
        redis_connect_timeout: 1,
        access_token_expire_minutes: 30,
        gemini_api_base: "http://unused".into(),
        gemini_api_key: String::new(),
        generation_model: "gemini-test".into(),
        embedding_model: "embedding-test".into(),
        pinecone_index_host: "http://unused".into(),
        pinecone_api_key: String::new(),
        upstream_timeout_secs: 5,
        metrics_timeout_secs: 1,
        temperature: 0.3,
        top_p: 0.7,
        top_k: 40,
        max_output_tokens: 1024,
        retrieval_top_k: 5,
        history_limit: 10,
        metrics_enabled: true,
        cors_allow_origins: vec!["*".into()],
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("test store lock")
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<Vec<User>>,
}

impl MemoryUserStore {
    pub fn count(&self) -> usize {
        lock(&self.users).len()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(lock(&self.users).iter().find(|u| u.email == email).cloned())
    }

    async fn insert(&self, user: &User) -> anyhow::Result<()> {
        lock(&self.users).push(user.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, UserId>>,
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn register(&self, token: &str, user_id: UserId, _ttl_seconds: u64) -> anyhow::Result<()> {
        lock(&self.tokens).insert(token.to_string(), user_id);
        Ok(())
    }

    async fn resolve(&self, token: &str) -> anyhow::Result<Option<UserId>> {
        Ok(lock(&self.tokens).get(token).copied())
    }
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    logs: Mutex<HashMap<(UserId, SessionId), Vec<String>>>,
}

impl MemoryHistoryStore {
    pub fn lines(&self, user_id: UserId, session_id: &SessionId) -> Vec<String> {
        lock(&self.logs)
            .get(&(user_id, session_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_lines(&self) -> usize {
        lock(&self.logs).values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ChatHistoryStore for MemoryHistoryStore {
    async fn append(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        lines: Vec<String>,
    ) -> anyhow::Result<()> {
        lock(&self.logs)
            .entry((user_id, session_id.clone()))
            .or_default()
            .extend(lines);
        Ok(())
    }

    async fn recent(
        &self,
        user_id: UserId,
        session_id: &SessionId,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let lines = self.lines(user_id, session_id);
        let start = lines.len().saturating_sub(limit);
        Ok(lines[start..].to_vec())
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    records: Mutex<Vec<VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn records(&self) -> Vec<VectorRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn query(
        &self,
        _vector: Vec<f32>,
        top_k: usize,
        session_id: &SessionId,
    ) -> Result<Vec<VectorMatch>, UpstreamError> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| r.metadata.session_id == session_id.as_str())
            .take(top_k)
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: 1.0,
                text: r.metadata.text.clone(),
                session_id: r.metadata.session_id.clone(),
            })
            .collect())
    }

    async fn upsert(&self, record: VectorRecord) -> Result<(), UpstreamError> {
        let mut records = lock(&self.records);
        records.retain(|r| r.id != record.id);
        records.push(record);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMetricsStore {
    logs: Mutex<HashMap<SessionId, Vec<ResponseMetrics>>>,
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn push(&self, metrics: &ResponseMetrics) -> anyhow::Result<()> {
        lock(&self.logs)
            .entry(metrics.session_id.clone())
            .or_default()
            .insert(0, metrics.clone());
        Ok(())
    }

    async fn list(&self, session_id: &SessionId) -> anyhow::Result<Vec<ResponseMetrics>> {
        Ok(lock(&self.logs).get(session_id).cloned().unwrap_or_default())
    }
}

/// Deterministic embedding derived from the text length.
#[derive(Default)]
pub struct ScriptedEmbedder;

#[async_trait]
impl Embedder for ScriptedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        Ok(vec![1.0, text.len() as f32 / 100.0])
    }
}

/// Answers `Echo: <utterance>` and keeps every prompt it was given.
#[derive(Default)]
pub struct ScriptedGenerator {
    prompts: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl ScriptedGenerator {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        lock(&self.prompts).last().cloned()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _sampling: &SamplingConfig) -> Result<String, UpstreamError> {
        lock(&self.prompts).push(prompt.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status {
                service: "generation",
                status: 503,
                body: "overloaded".into(),
            });
        }
        let utterance = prompt
            .split("## Current User Query\nUser: ")
            .nth(1)
            .and_then(|rest| rest.split("\n\n## Response").next())
            .unwrap_or_default();
        Ok(format!("Echo: {}", utterance))
    }
}

pub struct StaticProbe(pub bool);

#[async_trait]
impl CacheProbe for StaticProbe {
    async fn ping(&self) -> anyhow::Result<()> {
        if self.0 {
            Ok(())
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub users: Arc<MemoryUserStore>,
    pub tokens: Arc<MemoryTokenStore>,
    pub history: Arc<MemoryHistoryStore>,
    pub vectors: Arc<MemoryVectorStore>,
    pub metrics_store: Arc<MemoryMetricsStore>,
    pub generator: Arc<ScriptedGenerator>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_probe(true)
    }

    pub fn with_probe(redis_up: bool) -> Self {
        let config = test_config();
        let users = Arc::new(MemoryUserStore::default());
        let tokens = Arc::new(MemoryTokenStore::default());
        let history = Arc::new(MemoryHistoryStore::default());
        let vectors = Arc::new(MemoryVectorStore::default());
        let metrics_store = Arc::new(MemoryMetricsStore::default());
        let generator = Arc::new(ScriptedGenerator::default());

        let auth = AuthService::new(
            users.clone(),
            tokens.clone(),
            config.access_token_ttl_seconds(),
        );
        let metrics = MetricsCollector::new(metrics_store.clone());
        let pipeline = Arc::new(TurnPipeline::new(
            Arc::new(ScriptedEmbedder),
            generator.clone(),
            vectors.clone(),
            history.clone(),
            metrics.clone(),
            PipelineSettings::from(&config),
        ));
        let state = AppState::new(
            config,
            auth,
            tokens.clone(),
            pipeline,
            metrics,
            Arc::new(StaticProbe(redis_up)),
        );

        Self {
            router: build_router(state.clone()),
            state,
            users,
            tokens,
            history,
            vectors,
            metrics_store,
            generator,
        }
    }

    /// Registers a token for a fresh user without going through signup.
    pub async fn issue_token(&self) -> (UserId, String) {
        let user_id = UserId::new();
        let token = generate_access_token();
        self.tokens
            .register(&token, user_id, 60)
            .await
            .expect("register token");
        (user_id, token)
    }

    /// Serves the router on an ephemeral port.
    pub async fn spawn(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let router = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        addr
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
