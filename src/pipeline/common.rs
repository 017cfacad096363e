//! Pipelines shared by group and project imports.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use crate::error::ImportError;
use crate::pipeline::extractors::RestExtractor;
use crate::pipeline::loaders::RecordLoader;
use crate::pipeline::transformers::{ProhibitedAttributesTransformer, SliceKeysTransformer};
use crate::pipeline::{Context, EtlPipeline, ExtractedData, Pipeline, Transformer};
use crate::storage::{records, trackers};

pub const LABELS: &str = "labels";
pub const MILESTONES: &str = "milestones";
pub const BADGES: &str = "badges";
pub const BOARDS: &str = "boards";
pub const UPLOADS: &str = "uploads";
pub const ENTITY_FINISHER: &str = "entity_finisher";

/// Relation the finisher's summary is stored under.
pub const IMPORT_SUMMARY: &str = "import_summary";

pub fn labels() -> EtlPipeline {
    EtlPipeline::new(LABELS, RestExtractor::collection("labels"), RecordLoader::new("title"))
        .transformer(ProhibitedAttributesTransformer)
}

pub fn milestones() -> EtlPipeline {
    EtlPipeline::new(
        MILESTONES,
        RestExtractor::collection("milestones"),
        RecordLoader::new("title"),
    )
    .transformer(ProhibitedAttributesTransformer)
}

pub fn badges() -> EtlPipeline {
    EtlPipeline::new(BADGES, RestExtractor::collection("badges"), RecordLoader::new("link_url"))
        .transformer(SliceKeysTransformer::new(&["name", "link_url", "image_url"]))
}

pub fn boards() -> EtlPipeline {
    EtlPipeline::new(BOARDS, RestExtractor::collection("boards"), RecordLoader::new("name"))
        .transformer(ProhibitedAttributesTransformer)
}

pub fn uploads() -> EtlPipeline {
    EtlPipeline::new(UPLOADS, RestExtractor::collection("uploads"), RecordLoader::new("id"))
        .transformer(SliceKeysTransformer::new(&["id", "filename", "size", "created_at"]))
}

// ─────────────────────────────────────────────────────────────────────────────
// EntityFinisher
// ─────────────────────────────────────────────────────────────────────────────

/// Last stage of every entity: records the outcome of each relation.
#[derive(Default)]
pub struct EntityFinisher {
    transformers: Vec<Box<dyn Transformer>>,
}

impl Pipeline for EntityFinisher {
    fn name(&self) -> &'static str {
        ENTITY_FINISHER
    }

    fn extract<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<ExtractedData, ImportError>> {
        Box::pin(async move {
            let relations: BTreeMap<String, &'static str> =
                trackers::list_trackers(&ctx.db, ctx.entity.id)
                    .await?
                    .into_iter()
                    .filter(|t| t.relation != ENTITY_FINISHER)
                    .map(|t| (t.relation, t.status.as_str()))
                    .collect();

            Ok(ExtractedData::single(json!({
                "source_full_path": ctx.entity.source_full_path,
                "destination_full_path": ctx.entity.destination_full_path(),
                "relations": relations,
            })))
        })
    }

    fn transformers(&self) -> &[Box<dyn Transformer>] {
        &self.transformers
    }

    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            records::upsert_record(&ctx.db, ctx.entity.id, IMPORT_SUMMARY, "summary", &item).await?;
            Ok(())
        })
    }
}
