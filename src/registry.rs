//! Pipeline lookup by name and entity registration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::capabilities::ConfigCapabilities;
use crate::config::FeatureFlagConfig;
use crate::entity::{Entity, EntityStatus, NewEntity};
use crate::error::ImportError;
use crate::pipeline::{common, Pipeline};
use crate::stage::{StageBuilder, StageConfig};
use crate::storage::{entities, trackers, Database};
use crate::{groups, projects};

// ─────────────────────────────────────────────────────────────────────────────
// PipelineRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Pipelines by tracker relation.
#[derive(Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<&'static str, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pipeline a standard stage map can reference.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(groups::pipelines::group())
            .register(groups::pipelines::subgroup_entities())
            .register(groups::pipelines::project_entities())
            .register(groups::pipelines::members())
            .register(projects::pipelines::project())
            .register(projects::pipelines::repository())
            .register(projects::pipelines::issues())
            .register(projects::wiki::WikiPipeline::default())
            .register(common::labels())
            .register(common::milestones())
            .register(common::badges())
            .register(common::boards())
            .register(common::uploads())
            .register(common::EntityFinisher::default());
        registry
    }

    pub fn register(&mut self, pipeline: impl Pipeline + 'static) -> &mut Self {
        self.pipelines.insert(pipeline.name(), Arc::new(pipeline));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EntityRegistrar
// ─────────────────────────────────────────────────────────────────────────────

/// Persists entities together with one tracker per configured pipeline.
pub struct EntityRegistrar {
    builder: StageBuilder,
    flags: HashMap<String, FeatureFlagConfig>,
    registry: PipelineRegistry,
}

impl EntityRegistrar {
    pub fn new(
        builder: StageBuilder,
        flags: HashMap<String, FeatureFlagConfig>,
        registry: PipelineRegistry,
    ) -> Self {
        Self { builder, flags, registry }
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Capabilities resolved against the entity's reported source version.
    pub fn capabilities(&self, entity: &Entity) -> ConfigCapabilities {
        ConfigCapabilities::new(entity.source_version.as_deref(), &self.flags)
    }

    pub fn stages_for(&self, entity: &Entity) -> Result<StageConfig, ImportError> {
        let stages = self.builder.build(entity, &self.capabilities(entity))?;

        let unknown: Vec<&str> = stages
            .stages()
            .flat_map(|(_, pipelines)| pipelines.iter().copied())
            .filter(|name| !self.registry.contains(name))
            .collect();
        if !unknown.is_empty() {
            return Err(ImportError::Configuration(format!(
                "Unknown pipelines: {}",
                unknown.join(", ")
            )));
        }

        Ok(stages)
    }

    /// Whether `name` is part of the entity's stage map.
    pub fn pipeline_exists(&self, entity: &Entity, name: &str) -> Result<bool, ImportError> {
        Ok(self.stages_for(entity)?.contains(name))
    }

    /// Inserts the entity and creates its trackers.
    ///
    /// If the trackers cannot be created the entity is kept, marked failed.
    pub async fn register(&self, db: &Database, new_entity: NewEntity) -> Result<Entity, ImportError> {
        let entity = entities::insert_entity(db, new_entity).await?;

        let created = match self.stages_for(&entity) {
            Ok(stages) => trackers::create_trackers(db, entity.id, stages.trackers_for(entity.id)).await,
            Err(e) => Err(e),
        };

        match created {
            Ok(created) => {
                info!(
                    entity_id = entity.id,
                    "[ORCHESTRATOR] Registered {} {} with {} trackers",
                    entity.entity_type(),
                    entity.source_full_path,
                    created.len()
                );
                Ok(entity)
            }
            Err(e) => {
                warn!(
                    entity_id = entity.id,
                    "[ORCHESTRATOR] Failed to register {}: {}",
                    entity.source_full_path,
                    e.sanitized_message()
                );
                entities::update_entity_status(db, entity.id, EntityStatus::Failed).await?;
                Err(e)
            }
        }
    }
}
