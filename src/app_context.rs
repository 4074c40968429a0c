//! Shared dependency container.
//!
//! Everything that used to be ambient process state (model configs,
//! semaphores, repositories, queue clients) lives here explicitly and
//! is passed to the orchestrator and stages. No module-level mutable
//! state anywhere in the crate.

use std::sync::Arc;

use crate::{
    config::types::WorkerConfig,
    core::{
        error::{PipelineError, PipelineResult},
        governor::ConcurrencyGovernor,
        history::HistoryArchive,
        lock::LockManager,
        status::StatusManager,
    },
    data_connector::CoordStore,
    inference::Inference,
    media::MediaProcessor,
    registry::ModelRegistry,
    storage::{catalog::CatalogStore, ArtifactStore},
    tunnel::TunnelManager,
};

pub struct PipelineContext {
    pub config: WorkerConfig,
    pub store: Arc<dyn CoordStore>,
    pub locks: LockManager,
    pub status: StatusManager,
    pub history: HistoryArchive,
    pub registry: Arc<ModelRegistry>,
    pub tunnels: TunnelManager,
    pub inference: Arc<dyn Inference>,
    pub media: Arc<dyn MediaProcessor>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub governor: ConcurrencyGovernor,
    pub http: reqwest::Client,
}

impl PipelineContext {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CoordStore>,
        inference: Arc<dyn Inference>,
        media: Arc<dyn MediaProcessor>,
        artifacts: Arc<dyn ArtifactStore>,
        catalog: Arc<dyn CatalogStore>,
    ) -> PipelineResult<Arc<Self>> {
        let registry = Arc::new(ModelRegistry::new(Arc::clone(&store)));
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect)
            .build()
            .map_err(|e| PipelineError::Network {
                context: "http client".into(),
                message: e.to_string(),
            })?;

        Ok(Arc::new(Self {
            locks: LockManager::new(Arc::clone(&store), config.lock_ttl),
            status: StatusManager::new(Arc::clone(&store), config.cancel_ttl),
            history: HistoryArchive::new(
                Arc::clone(&store),
                config.history_ttl,
                config.history_max_runs,
            ),
            tunnels: TunnelManager::new(Arc::clone(&registry), config.tunnel.clone()),
            governor: ConcurrencyGovernor::new(&config.limits),
            registry,
            store,
            inference,
            media,
            artifacts,
            catalog,
            http,
            config,
        }))
    }
}
