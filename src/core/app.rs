use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::core::config::AppConfig;
use crate::core::reconciliation::postmark::{PostmarkClient, PostmarkReconciliationTask};
use crate::core::reconciliation::{EventLogger, ReconciliationScheduler, TaskRegistry, TaskRunner};
use crate::core::store::Store;

/// Process-wide wiring: one store, one registry, one scheduler.
pub struct App {
    pub config: AppConfig,
    pub data_dir: PathBuf,
    pub store: Store,
    pub scheduler: ReconciliationScheduler,
}

impl App {
    pub async fn build(config: AppConfig, data_dir: &Path) -> Result<Self> {
        let store = Store::open(config.database_path(data_dir), config.lock.lease_secs).await?;
        let events = EventLogger::new(Arc::new(store.clone()));

        let registry = Arc::new(TaskRegistry::new());
        let client = PostmarkClient::new(&config.postmark)?;
        registry.register(Arc::new(PostmarkReconciliationTask::new(
            Arc::new(client),
            Arc::new(store.clone()),
            events.clone(),
        )));

        let runner = TaskRunner::new(
            registry.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            events,
        );
        let scheduler = ReconciliationScheduler::new(runner).await?;
        info!("Registered {} reconciliation task(s)", registry.len());

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            store,
            scheduler,
        })
    }
}
