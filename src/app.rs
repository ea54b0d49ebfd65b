use std::sync::Arc;

use crate::blocking::SessionSnapshotService;
use crate::config::AppConfig;
use crate::metrics::AppMetrics;
use crate::poller::PollerRegistry;
use crate::repository::Repository;

/// Shared application context passed to HTTP handlers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub metrics: AppMetrics,
    pub repository: Arc<Repository>,
    pub registry: Arc<PollerRegistry>,
    pub sessions: Arc<SessionSnapshotService>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        metrics: AppMetrics,
        repository: Arc<Repository>,
        registry: Arc<PollerRegistry>,
    ) -> Self {
        let sessions = Arc::new(SessionSnapshotService::new(registry.clone()));
        Self {
            config: Arc::new(config),
            metrics,
            repository,
            registry,
            sessions,
        }
    }
}
