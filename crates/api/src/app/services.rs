//! Infrastructure wiring: stage client, job store, orchestrator and runner.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use laudaflow_ai::{PipelineOrchestrator, RetryPolicy, StageClient, StageTargets};
use laudaflow_infra::config::{AppConfig, StoreConfig};
use laudaflow_infra::external::AssistantsClient;
use laudaflow_infra::jobs::{InMemoryJobStore, JobRunner, JobRunnerConfig, JobStore, JobStoreError, PostgresJobStore};

/// Startup failure while wiring services.
#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("failed to build stage client: {0}")]
    StageClient(String),
    #[error("failed to connect to Postgres: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to prepare job store: {0}")]
    Store(#[from] JobStoreError),
}

/// Services shared by all handlers.
pub struct AppServices {
    pub runner: Arc<JobRunner>,
}

impl AppServices {
    /// Wire a runner from already-built parts.
    pub async fn start(
        client: Arc<dyn StageClient>,
        store: Arc<dyn JobStore>,
        targets: StageTargets,
        retry_policy: RetryPolicy,
        runner_config: JobRunnerConfig,
    ) -> Self {
        let orchestrator = Arc::new(PipelineOrchestrator::new(client, targets).with_retry_policy(retry_policy));
        let runner = JobRunner::start(runner_config, store, orchestrator).await;
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Drain in-flight jobs and stop background tasks.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }
}

pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    let client = AssistantsClient::new(config.remote.assistants.clone())
        .map_err(|e| ServicesError::StageClient(e.to_string()))?;

    let store: Arc<dyn JobStore> = match &config.store {
        StoreConfig::Postgres { database_url } => {
            let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
            let store = PostgresJobStore::new(pool);
            store.ensure_schema().await?;
            info!("using Postgres job store");
            Arc::new(store)
        }
        StoreConfig::InMemory => {
            info!("using in-memory job store");
            InMemoryJobStore::arc()
        }
    };

    Ok(AppServices::start(
        Arc::new(client),
        store,
        config.remote.targets.clone(),
        config.remote.retry_policy(),
        config.runner.clone(),
    )
    .await)
}
