//! Process-wide search state handed to every component.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::ResultCache;
use crate::pool::WorkerPool;
use crate::registry::TaskRegistry;
use crate::settings::OrchestratorConfig;

/// Built once at startup and shared by reference with runners, finalizers
/// and the request layer. Dropped only at shutdown.
pub struct SearchContext {
    pub registry: TaskRegistry,
    pub cache: ResultCache,
    pub pool: WorkerPool,
    pub fetch_timeout: Duration,
}

impl SearchContext {
    pub fn new(pool_size: usize, fetch_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry: TaskRegistry::new(),
            cache: ResultCache::new(),
            pool: WorkerPool::new(pool_size),
            fetch_timeout,
        })
    }

    pub fn from_config(config: &OrchestratorConfig) -> Arc<Self> {
        Self::new(
            config.worker_pool_size,
            Duration::from_secs(config.fetch_timeout_seconds),
        )
    }
}
