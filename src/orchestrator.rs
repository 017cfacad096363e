//! Stage dispatch, stale sweeps and entity/import finalization.
//!
//! Stages form an eventually consistent barrier: every call re-reads tracker
//! state, and the `created → enqueued` compare-and-swap keeps concurrent or
//! redundant calls from double-dispatching a tracker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::entity::{Entity, EntityStatus};
use crate::error::ImportError;
use crate::queue::{JobQueue, PipelineJob};
use crate::storage::imports::{self, ImportStatus};
use crate::storage::{current_timestamp, entities, trackers, Database};
use crate::tracker::{TrackerEvent, TrackerStatus};

/// Result of one [`Orchestrator::dispatch_next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Trackers of `stage` were enqueued.
    Enqueued { stage: u32, trackers: usize },
    /// A stage is still running; nothing to do yet.
    Waiting,
    /// No tracker left to dispatch; the entity was finalized with this status.
    Complete(EntityStatus),
    /// The entity was already finished.
    Inactive,
}

pub struct Orchestrator {
    db: Database,
    queue: Arc<dyn JobQueue>,
    stale_window: Duration,
}

impl Orchestrator {
    pub fn new(db: Database, queue: Arc<dyn JobQueue>, stale_window: Duration) -> Self {
        Self { db, queue, stale_window }
    }

    /// True iff a tracker of `stage` is `created`, `enqueued` or `started`.
    pub async fn stage_running(&self, entity_id: i64, stage: u32) -> Result<bool, ImportError> {
        trackers::stage_running(&self.db, entity_id, stage).await
    }

    /// Enqueues the entity's earliest stage that still has `created` trackers.
    ///
    /// `current_stage` is the stage of the job that triggered the call, if
    /// any: while it is still running nothing is dispatched.
    pub async fn dispatch_next(
        &self,
        entity: &Entity,
        current_stage: Option<u32>,
    ) -> Result<Dispatch, ImportError> {
        if entity.status == EntityStatus::Finished || entity.status == EntityStatus::Timeout {
            return Ok(Dispatch::Inactive);
        }

        if let Some(stage) = current_stage {
            if self.stage_running(entity.id, stage).await? {
                return Ok(Dispatch::Waiting);
            }
        }

        let Some(stage) = trackers::next_created_stage(&self.db, entity.id).await? else {
            return self.finalize_entity(entity).await;
        };

        if trackers::earlier_stage_running(&self.db, entity.id, stage).await? {
            return Ok(Dispatch::Waiting);
        }

        if entity.status == EntityStatus::Created {
            entities::update_entity_status(&self.db, entity.id, EntityStatus::Started).await?;
        }

        let mut enqueued = 0;
        for tracker in trackers::list_stage_trackers(&self.db, entity.id, stage).await? {
            if tracker.status != TrackerStatus::Created {
                continue;
            }
            // Lost the race to another dispatcher
            let Some(tracker) = trackers::try_enqueue(&self.db, tracker.id).await? else {
                continue;
            };

            self.queue
                .enqueue(PipelineJob::new(tracker.id, entity.id, tracker.stage))
                .await?;
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(
                entity_id = entity.id,
                stage,
                "[ORCHESTRATOR] Enqueued {} trackers",
                enqueued
            );
        }

        Ok(Dispatch::Enqueued { stage, trackers: enqueued })
    }

    /// Dispatches every active entity of an import and finalizes the import
    /// once all of its entities are done.
    pub async fn dispatch_import(&self, import_id: &str) -> Result<ImportStatus, ImportError> {
        let import = imports::get_import(&self.db, import_id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("Bulk import {import_id}")))?;
        if import.status.is_terminal() {
            return Ok(import.status);
        }
        if import.status == ImportStatus::Created {
            imports::update_import_status(&self.db, import_id, ImportStatus::Started).await?;
        }

        for entity in self.entities_to_drive(import_id).await? {
            self.dispatch_next(&entity, None).await?;
        }

        self.finalize_import(import_id).await
    }

    /// Re-enqueues trackers whose jobs were lost, e.g. by a restart.
    pub async fn recover(&self, import_id: &str) -> Result<usize, ImportError> {
        let mut recovered = 0;

        for entity in self.entities_to_drive(import_id).await? {
            for tracker in trackers::list_trackers(&self.db, entity.id).await? {
                if matches!(tracker.status, TrackerStatus::Enqueued | TrackerStatus::Started) {
                    self.queue
                        .enqueue(PipelineJob::new(tracker.id, entity.id, tracker.stage))
                        .await?;
                    recovered += 1;
                }
            }
        }

        if recovered > 0 {
            info!("[ORCHESTRATOR] Re-enqueued {} in-flight trackers of {}", recovered, import_id);
        }
        Ok(recovered)
    }

    /// Times out trackers stuck past the staleness window.
    ///
    /// `started` trackers are stale once untouched for the window. `created`
    /// trackers only count once their stage became eligible, so stages that
    /// were never reached are left alone.
    pub async fn sweep_stale(&self, import_id: &str) -> Result<usize, ImportError> {
        let cutoff = current_timestamp() - self.stale_window.as_secs() as i64;
        let mut swept = 0;

        for entity in self.entities_to_drive(import_id).await? {
            // Decide before sweeping, so one pass never unblocks the next stage
            let mut stale = Vec::new();
            for tracker in trackers::list_stale_trackers(&self.db, entity.id, cutoff).await? {
                if tracker.status == TrackerStatus::Created
                    && trackers::earlier_stage_running(&self.db, entity.id, tracker.stage).await?
                {
                    continue;
                }
                stale.push(tracker);
            }

            for tracker in stale {
                match trackers::apply_event(&self.db, tracker.id, TrackerEvent::CleanupStale, None)
                    .await
                {
                    Ok(_) => {
                        warn!(
                            entity_id = entity.id,
                            tracker_id = tracker.id,
                            pipeline_name = tracker.relation.as_str(),
                            stage = tracker.stage,
                            "[SWEEP] Timed out stale tracker"
                        );
                        swept += 1;
                    }
                    // Moved on since the query
                    Err(ImportError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(swept)
    }

    /// Entities that may still have trackers to run. Failed entities are
    /// included: their remaining trackers are drained by the workers.
    async fn entities_to_drive(&self, import_id: &str) -> Result<Vec<Entity>, ImportError> {
        Ok(entities::list_entities(&self.db, import_id)
            .await?
            .into_iter()
            .filter(|e| !matches!(e.status, EntityStatus::Finished | EntityStatus::Timeout))
            .collect())
    }

    /// Settles the entity status once nothing is left to run.
    async fn finalize_entity(&self, entity: &Entity) -> Result<Dispatch, ImportError> {
        let all = trackers::list_trackers(&self.db, entity.id).await?;
        if all.iter().any(|t| !t.status.is_terminal()) {
            return Ok(Dispatch::Waiting);
        }

        let status = if entity.status == EntityStatus::Failed
            || all.iter().any(|t| t.status == TrackerStatus::Failed)
        {
            EntityStatus::Failed
        } else if all.iter().any(|t| t.status == TrackerStatus::Timeout) {
            EntityStatus::Timeout
        } else {
            EntityStatus::Finished
        };

        if entity.status != status {
            entities::update_entity_status(&self.db, entity.id, status).await?;
            info!(
                entity_id = entity.id,
                "[ORCHESTRATOR] {} {} {}",
                entity.entity_type(),
                entity.source_full_path,
                status.as_str()
            );
        }

        Ok(Dispatch::Complete(status))
    }

    /// Finishes the import once every entity is terminal. An import whose
    /// entities all failed is failed.
    async fn finalize_import(&self, import_id: &str) -> Result<ImportStatus, ImportError> {
        let all = entities::list_entities(&self.db, import_id).await?;

        // Failed entities may still have trackers to drain
        for entity in &all {
            if entity.status == EntityStatus::Failed {
                let pending = trackers::list_trackers(&self.db, entity.id)
                    .await?
                    .iter()
                    .any(|t| !t.status.is_terminal());
                if pending {
                    return Ok(ImportStatus::Started);
                }
            }
        }

        if all.iter().any(|e| !e.status.is_terminal()) {
            return Ok(ImportStatus::Started);
        }

        let status = if !all.is_empty() && all.iter().all(|e| e.status == EntityStatus::Failed) {
            ImportStatus::Failed
        } else {
            ImportStatus::Finished
        };
        imports::update_import_status(&self.db, import_id, status).await?;
        info!("[ORCHESTRATOR] Bulk import {} {}", import_id, status.as_str());

        Ok(status)
    }
}
