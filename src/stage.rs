//! Stage configuration: which pipelines run for an entity, and in what order.
//!
//! Stages run strictly in sequence; pipelines within one stage run
//! independently. The map is assembled by [`StageContributor`]s registered
//! on a [`StageBuilder`] at startup.

use std::collections::BTreeMap;

use crate::capabilities::Capabilities;
use crate::config::StagesConfig;
use crate::entity::Entity;
use crate::error::ImportError;
use crate::tracker::NewTracker;
use crate::{groups, projects};

// ─────────────────────────────────────────────────────────────────────────────
// StageConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Stage number → pipeline names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageConfig {
    stages: BTreeMap<u32, Vec<&'static str>>,
}

impl StageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pipeline to a stage. Adding the same pipeline twice is a no-op.
    pub fn add(&mut self, stage: u32, pipeline: &'static str) -> &mut Self {
        let pipelines = self.stages.entry(stage).or_default();
        if !pipelines.contains(&pipeline) {
            pipelines.push(pipeline);
        }
        self
    }

    pub fn contains(&self, pipeline: &str) -> bool {
        self.stage_of(pipeline).is_some()
    }

    pub fn stage_of(&self, pipeline: &str) -> Option<u32> {
        self.stages
            .iter()
            .find(|(_, pipelines)| pipelines.iter().any(|p| *p == pipeline))
            .map(|(stage, _)| *stage)
    }

    pub fn pipelines(&self, stage: u32) -> &[&'static str] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn stages(&self) -> impl Iterator<Item = (u32, &[&'static str])> {
        self.stages.iter().map(|(stage, p)| (*stage, p.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.stages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stages must be numbered 0..n without gaps, stage 0 holds exactly one
    /// pipeline and no pipeline appears in two stages.
    pub fn validate(&self) -> Result<(), ImportError> {
        let mut errors: Vec<String> = Vec::new();

        for (expected, stage) in self.stages.keys().enumerate() {
            if *stage as usize != expected {
                errors.push(format!("stage {expected} is missing"));
                break;
            }
        }

        match self.stages.get(&0).map(Vec::len) {
            Some(1) => {}
            Some(n) => errors.push(format!("stage 0 must have exactly one pipeline, found {n}")),
            None if !self.stages.is_empty() => {}
            None => errors.push("no stages configured".into()),
        }

        let mut seen: Vec<&str> = Vec::new();
        for pipeline in self.stages.values().flatten() {
            if seen.contains(pipeline) {
                errors.push(format!("pipeline {pipeline} appears in more than one stage"));
            }
            seen.push(pipeline);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ImportError::Configuration(errors.join("; ")))
        }
    }

    /// One tracker per configured pipeline, in stage order.
    pub fn trackers_for(&self, entity_id: i64) -> Vec<NewTracker> {
        self.stages()
            .flat_map(|(stage, pipelines)| {
                pipelines.iter().map(move |pipeline| NewTracker {
                    entity_id,
                    relation: pipeline.to_string(),
                    stage,
                })
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StageContributor / StageBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Adds pipelines to an entity's stage map.
///
/// Contributors ignore entities they do not apply to.
pub trait StageContributor: Send + Sync {
    fn name(&self) -> &'static str;

    fn contribute(&self, entity: &Entity, caps: &dyn Capabilities, config: &mut StageConfig);
}

/// Runs contributors in registration order and validates the result.
#[derive(Default)]
pub struct StageBuilder {
    contributors: Vec<Box<dyn StageContributor>>,
}

impl StageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, contributor: impl StageContributor + 'static) -> Self {
        self.contributors.push(Box::new(contributor));
        self
    }

    /// Group and project stages, plus the optional contributors enabled in `config`.
    pub fn standard(config: &StagesConfig) -> Self {
        let builder = Self::new()
            .with(groups::stage::GroupStages)
            .with(groups::stage::ProjectEntitiesContributor)
            .with(projects::stage::ProjectStages);

        if config.group_wiki {
            builder.with(groups::stage::GroupWikiContributor)
        } else {
            builder
        }
    }

    pub fn contributor_names(&self) -> Vec<&'static str> {
        self.contributors.iter().map(|c| c.name()).collect()
    }

    pub fn build(&self, entity: &Entity, caps: &dyn Capabilities) -> Result<StageConfig, ImportError> {
        let mut config = StageConfig::new();
        for contributor in &self.contributors {
            contributor.contribute(entity, caps, &mut config);
        }
        config.validate()?;
        Ok(config)
    }
}
