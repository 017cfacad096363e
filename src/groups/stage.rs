//! Stage contributors for group entities.

use crate::capabilities::{Capabilities, SourceFeature, PROJECT_MIGRATION_FLAG};
use crate::entity::Entity;
use crate::groups::pipelines::{GROUP, MEMBERS, PROJECT_ENTITIES, SUBGROUP_ENTITIES};
use crate::pipeline::common::{BADGES, BOARDS, ENTITY_FINISHER, LABELS, MILESTONES, UPLOADS};
use crate::projects::wiki::WIKI;
use crate::stage::{StageConfig, StageContributor};

/// Base group stages.
pub struct GroupStages;

impl StageContributor for GroupStages {
    fn name(&self) -> &'static str {
        "groups"
    }

    fn contribute(&self, entity: &Entity, _caps: &dyn Capabilities, config: &mut StageConfig) {
        if !entity.is_group() {
            return;
        }

        config
            .add(0, GROUP)
            .add(1, SUBGROUP_ENTITIES)
            .add(1, MEMBERS)
            .add(1, LABELS)
            .add(1, MILESTONES)
            .add(1, BADGES)
            .add(2, BOARDS)
            .add(2, UPLOADS)
            .add(3, ENTITY_FINISHER);
    }
}

/// Migrates the group's projects when the source supports it and the
/// project migration flag is on for the destination's root namespace.
pub struct ProjectEntitiesContributor;

impl StageContributor for ProjectEntitiesContributor {
    fn name(&self) -> &'static str {
        "project_entities"
    }

    fn contribute(&self, entity: &Entity, caps: &dyn Capabilities, config: &mut StageConfig) {
        if !entity.is_group() {
            return;
        }

        if caps.version_supports(SourceFeature::ProjectMigration)
            && caps.flag_enabled(PROJECT_MIGRATION_FLAG, entity.root_ancestor())
        {
            config.add(1, PROJECT_ENTITIES);
        }
    }
}

/// Group wikis.
pub struct GroupWikiContributor;

impl StageContributor for GroupWikiContributor {
    fn name(&self) -> &'static str {
        "group_wiki"
    }

    fn contribute(&self, entity: &Entity, _caps: &dyn Capabilities, config: &mut StageConfig) {
        if entity.is_group() {
            config.add(2, WIKI);
        }
    }
}
