pub mod auth;
pub mod health;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod session_registry;
pub mod token_cache;

pub use auth::AuthService;
pub use health::{CacheProbe, RedisCacheProbe};
pub use llm::{Embedder, GeminiClient, Generator, SamplingConfig};
pub use metrics::MetricsCollector;
pub use pipeline::{PipelineSettings, TurnPipeline, TurnReply};
pub use session_registry::SessionRegistry;
pub use token_cache::{RedisTokenStore, TokenStore};
