//! Shared state for the CLI commands.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::ImportError;
use crate::pipeline::runner::RetryPolicy;
use crate::registry::{EntityRegistrar, PipelineRegistry};
use crate::repository::{GitRepositoryStore, RepositoryStore};
use crate::source::SourceClient;
use crate::stage::StageBuilder;
use crate::storage::Database;
use crate::validation::UrlBlocker;

// ─────────────────────────────────────────────────────────────────────────────
// Application State
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a command needs, built once from the configuration.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    /// Client scoped to the configured source instance and token.
    pub source: SourceClient,
    pub repositories: Arc<dyn RepositoryStore>,
    pub url_blocker: Arc<UrlBlocker>,
    pub registrar: Arc<EntityRegistrar>,
    pub policy: RetryPolicy,
}

impl AppState {
    /// Opens the database and builds the source client.
    pub async fn new(config: Config) -> Result<Self, ImportError> {
        let db = Database::init(config.database.path.clone()).await?;
        let source = SourceClient::new(
            &config.source.url,
            config.source.resolve_token()?,
            Duration::from_secs(config.source.request_timeout_secs),
        )?;

        Ok(Self {
            repositories: Arc::new(GitRepositoryStore::new(config.repositories.root.clone())),
            url_blocker: Arc::new(UrlBlocker::new(config.url_policy.clone())),
            registrar: Arc::new(EntityRegistrar::new(
                StageBuilder::standard(&config.stages),
                config.feature_flags.clone(),
                PipelineRegistry::standard(),
            )),
            policy: RetryPolicy::from(&config.retry),
            db,
            source,
            config,
        })
    }

    /// Replaces the repository store.
    pub fn with_repositories(mut self, repositories: Arc<dyn RepositoryStore>) -> Self {
        self.repositories = repositories;
        self
    }
}
