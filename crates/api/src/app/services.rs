//! Service wiring: store selection and the job engine.
//!
//! Everything is built once at startup and shared through an `Arc`; handlers
//! never initialise anything lazily.

use std::sync::Arc;

use edgepurge_infra::jobs::{EngineSettings, JobEngine};
use edgepurge_infra::store::{InMemoryStore, JobStore, PostgresStore, StoreError, StoreState};

use crate::config::{ApiConfig, ConfigError};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),
}

/// Shared application services.
#[derive(Clone)]
pub struct AppServices {
    pub engine: JobEngine,
    /// `"postgres"` or `"memory"`, reported by `/health`.
    pub backend: &'static str,
}

impl AppServices {
    pub fn new(store: Arc<dyn JobStore>, backend: &'static str) -> Self {
        Self {
            engine: JobEngine::new(store, EngineSettings::default()),
            backend,
        }
    }

    pub fn in_memory(state: StoreState) -> Self {
        Self::new(Arc::new(InMemoryStore::new(state)), "memory")
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise an in-memory store seeded from `SEED_FILE`.
pub async fn build_services(config: &ApiConfig) -> Result<AppServices, ServicesError> {
    if let Some(url) = &config.database_url {
        let store = PostgresStore::connect(url, config.db_max_connections).await?;
        store.apply_schema().await?;
        tracing::info!(max_connections = config.db_max_connections, "using postgres store");
        return Ok(AppServices::new(Arc::new(store), "postgres"));
    }

    let state = match &config.seed_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ConfigError::Seed {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            let state = StoreState::from_json(&raw)?;
            tracing::info!(
                path = %path.display(),
                delivery_services = state.delivery_services.len(),
                jobs = state.jobs.len(),
                "seeded in-memory store"
            );
            state
        }
        None => {
            tracing::warn!("no DATABASE_URL or SEED_FILE; starting with an empty in-memory store");
            StoreState::default()
        }
    };
    Ok(AppServices::in_memory(state))
}
