//! Import commands: register a manifest, then drive it to completion.
//!
//! `run_import` owns an in-process queue and worker pool for the lifetime of
//! one import. The poll loop re-dispatches every active entity and the sweep
//! loop times out stale trackers. Progress lives in the database, so an
//! interrupted import is resumed by running it again.

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capabilities::{Capabilities, ConfigCapabilities, SourceFeature};
use crate::config::EntityConfig;
use crate::entity::{NewEntity, SourceType};
use crate::error::ImportError;
use crate::orchestrator::Orchestrator;
use crate::queue::{InProcessQueue, JobQueue};
use crate::state::AppState;
use crate::storage::imports::{self, BulkImport, ImportStatus};
use crate::worker::{PipelineWorker, WorkerPool};

// ─────────────────────────────────────────────────────────────────────────────
// Start
// ─────────────────────────────────────────────────────────────────────────────

fn new_entity(entry: &EntityConfig) -> NewEntity {
    NewEntity {
        bulk_import_id: String::new(),
        parent_id: None,
        source_type: entry.source_type,
        source_full_path: entry.source_full_path.trim().trim_matches('/').to_string(),
        destination_namespace: entry.destination_namespace.trim().trim_matches('/').to_string(),
        destination_name: entry.destination_name.trim().to_string(),
        source_version: None,
    }
}

/// Creates an import for `manifest` and registers its entities.
///
/// Every entry is validated before anything is written. An entity whose
/// trackers cannot be created is kept, marked failed.
pub async fn start_import(
    state: &AppState,
    manifest: &[EntityConfig],
) -> Result<BulkImport, ImportError> {
    if manifest.is_empty() {
        return Err(ImportError::Validation("No entities to import".into()));
    }

    let pending: Vec<NewEntity> = manifest.iter().map(new_entity).collect();
    for entity in &pending {
        entity.validate(None)?;
    }

    let version = state.source.fetch_version().await?;
    let capabilities = ConfigCapabilities::new(Some(&version), &state.config.feature_flags);
    if pending.iter().any(|e| e.source_type == SourceType::ProjectEntity)
        && !capabilities.version_supports(SourceFeature::ProjectMigration)
    {
        return Err(ImportError::Validation(format!(
            "Source version {version} does not support project migration"
        )));
    }

    let source_url = state.config.source.url.trim_end_matches('/');
    let import = imports::create_import(&state.db, source_url, Some(&version)).await?;
    info!(
        "[ORCHESTRATOR] Created import {} of {} entities from {} ({})",
        import.id,
        pending.len(),
        source_url,
        version
    );

    for mut entity in pending {
        entity.bulk_import_id = import.id.clone();
        entity.source_version = Some(version.clone());
        let path = entity.source_full_path.clone();

        if let Err(e) = state.registrar.register(&state.db, entity).await {
            warn!(
                "[ORCHESTRATOR] Import {} continues without {}: {}",
                import.id,
                path,
                e.sanitized_message()
            );
        }
    }

    Ok(import)
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

/// Drives an import until it reaches a terminal status or `cancel` fires.
///
/// Trackers left `enqueued`/`started` by an earlier run are re-enqueued
/// first. On cancellation the pool finishes its in-flight jobs and the
/// import stays resumable.
pub async fn run_import(
    state: &AppState,
    import_id: &str,
    cancel: CancellationToken,
) -> Result<ImportStatus, ImportError> {
    let pool_cancel = cancel.child_token();
    let (queue, receiver) = InProcessQueue::new(pool_cancel.clone());
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    let orchestrator = Arc::new(Orchestrator::new(
        state.db.clone(),
        queue.clone(),
        state.config.stale.window(),
    ));
    let worker = Arc::new(PipelineWorker {
        db: state.db.clone(),
        source: state.source.clone(),
        repositories: state.repositories.clone(),
        url_blocker: state.url_blocker.clone(),
        registrar: state.registrar.clone(),
        queue,
        orchestrator: orchestrator.clone(),
        policy: state.policy.clone(),
        page_size: state.config.workers.page_size,
    });

    let pool = WorkerPool::new(worker, state.config.workers.concurrency, pool_cancel.clone());
    let pool_handle = tokio::spawn(pool.run(receiver));

    let result = drive(state, &orchestrator, import_id, &cancel).await;

    pool_cancel.cancel();
    if let Err(e) = pool_handle.await {
        error!("[WORKER] Pool task failed: {e}");
    }

    match &result {
        Ok(status) => info!("[ORCHESTRATOR] Import {} {}", import_id, status.as_str()),
        Err(ImportError::Cancelled) => {
            info!("[ORCHESTRATOR] Import {} interrupted, run it again to resume", import_id)
        }
        Err(e) => error!("[ORCHESTRATOR] Import {} stopped: {}", import_id, e.sanitized_message()),
    }
    result
}

async fn drive(
    state: &AppState,
    orchestrator: &Orchestrator,
    import_id: &str,
    cancel: &CancellationToken,
) -> Result<ImportStatus, ImportError> {
    orchestrator.recover(import_id).await?;

    let mut poll = interval(state.config.workers.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = interval(state.config.stale.sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            _ = poll.tick() => {
                let status = orchestrator.dispatch_import(import_id).await?;
                if status.is_terminal() {
                    return Ok(status);
                }
            }
            _ = sweep.tick() => {
                orchestrator.sweep_stale(import_id).await?;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sweep
// ─────────────────────────────────────────────────────────────────────────────

/// Times out stale trackers of one import, or of every unfinished import.
///
/// Returns the number of trackers swept.
pub async fn sweep(state: &AppState, import_id: Option<&str>) -> Result<usize, ImportError> {
    let import_ids = match import_id {
        Some(id) => {
            imports::get_import(&state.db, id)
                .await?
                .ok_or_else(|| ImportError::NotFound(format!("Bulk import {id}")))?;
            vec![id.to_string()]
        }
        None => imports::list_imports(&state.db)
            .await?
            .into_iter()
            .filter(|import| !import.status.is_terminal())
            .map(|import| import.id)
            .collect(),
    };

    // Sweeping never enqueues, so nothing reads this queue
    let (queue, _receiver) = InProcessQueue::new(CancellationToken::new());
    let orchestrator = Orchestrator::new(state.db.clone(), Arc::new(queue), state.config.stale.window());

    let mut swept = 0;
    for id in &import_ids {
        swept += orchestrator.sweep_stale(id).await?;
    }
    Ok(swept)
}
