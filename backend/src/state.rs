use std::sync::Arc;

use crate::{
    config::Config,
    services::{
        AuthService, CacheProbe, MetricsCollector, SessionRegistry, TokenStore, TurnPipeline,
    },
};

/// Shared handles injected into every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub auth: AuthService,
    pub tokens: Arc<dyn TokenStore>,
    pub pipeline: Arc<TurnPipeline>,
    pub registry: SessionRegistry,
    pub metrics: MetricsCollector,
    pub cache_probe: Arc<dyn CacheProbe>,
}

impl AppState {
    pub fn new(
        config: Config,
        auth: AuthService,
        tokens: Arc<dyn TokenStore>,
        pipeline: Arc<TurnPipeline>,
        metrics: MetricsCollector,
        cache_probe: Arc<dyn CacheProbe>,
    ) -> Self {
        Self {
            config,
            auth,
            tokens,
            pipeline,
            registry: SessionRegistry::new(),
            metrics,
            cache_probe,
        }
    }
}
