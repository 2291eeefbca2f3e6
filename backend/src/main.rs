use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shashtra_backend::{
    config::Config,
    db::{
        connection::{create_pool, DbPool},
        redis::create_redis_pool,
    },
    repositories::{PgUserStore, PineconeVectorStore, RedisChatHistoryStore, RedisMetricsStore},
    routes::build_router,
    services::{
        AuthService, GeminiClient, MetricsCollector, PipelineSettings, RedisCacheProbe,
        RedisTokenStore, TokenStore, TurnPipeline,
    },
    state::AppState,
};

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "<empty>".into();
    }
    let prefix = s.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, s.len())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shashtra_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        bind_addr = %config.bind_addr,
        redis_url = %config.redis_url,
        gemini_api_key = %mask_secret(&config.gemini_api_key),
        pinecone_api_key = %mask_secret(&config.pinecone_api_key),
        pinecone_index_host = %config.pinecone_index_host,
        generation_model = %config.generation_model,
        embedding_model = %config.embedding_model,
        access_token_expire_minutes = config.access_token_expire_minutes,
        metrics_enabled = config.metrics_enabled,
        "Loaded configuration from environment/.env"
    );

    // Initialize stores
    let pool: DbPool = create_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    let redis = create_redis_pool(&config).await?;

    let http = reqwest::Client::builder()
        .timeout(config.upstream_timeout())
        .build()?;
    let gemini = Arc::new(GeminiClient::new(http.clone(), &config));
    let vectors = Arc::new(PineconeVectorStore::new(
        http,
        config.pinecone_index_host.clone(),
        config.pinecone_api_key.clone(),
    ));

    let tokens: Arc<dyn TokenStore> = Arc::new(RedisTokenStore::new(redis.clone()));
    let auth = AuthService::new(
        Arc::new(PgUserStore::new(pool)),
        tokens.clone(),
        config.access_token_ttl_seconds(),
    );
    let metrics = MetricsCollector::new(Arc::new(RedisMetricsStore::new(redis.clone())));
    let pipeline = Arc::new(TurnPipeline::new(
        gemini.clone(),
        gemini,
        vectors,
        Arc::new(RedisChatHistoryStore::new(redis.clone())),
        metrics.clone(),
        PipelineSettings::from(&config),
    ));

    let state = AppState::new(
        config.clone(),
        auth,
        tokens,
        pipeline,
        metrics,
        Arc::new(RedisCacheProbe::new(redis)),
    );
    let app = build_router(state);

    // Start server
    tracing::info!("Server listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
