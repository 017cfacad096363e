//! Stage contributor for project entities.

use crate::capabilities::Capabilities;
use crate::entity::Entity;
use crate::pipeline::common::{BADGES, ENTITY_FINISHER, LABELS, MILESTONES, UPLOADS};
use crate::projects::pipelines::{ISSUES, PROJECT, REPOSITORY};
use crate::projects::wiki::WIKI;
use crate::stage::{StageConfig, StageContributor};

pub struct ProjectStages;

impl StageContributor for ProjectStages {
    fn name(&self) -> &'static str {
        "projects"
    }

    fn contribute(&self, entity: &Entity, _caps: &dyn Capabilities, config: &mut StageConfig) {
        if !entity.is_project() {
            return;
        }

        config
            .add(0, PROJECT)
            .add(1, REPOSITORY)
            .add(2, LABELS)
            .add(2, MILESTONES)
            .add(2, BADGES)
            .add(3, ISSUES)
            .add(3, WIKI)
            .add(3, UPLOADS)
            .add(4, ENTITY_FINISHER);
    }
}
