pub mod chat_history;
pub mod metrics;
pub mod user;
pub mod vector;

pub use chat_history::{ChatHistoryStore, RedisChatHistoryStore};
pub use metrics::{MetricsStore, RedisMetricsStore};
pub use user::{PgUserStore, UserStore};
pub use vector::{PineconeVectorStore, VectorMatch, VectorMetadata, VectorRecord, VectorStore};
