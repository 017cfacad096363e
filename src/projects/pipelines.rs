//! Project pipelines.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use crate::error::ImportError;
use crate::pipeline::extractors::RestExtractor;
use crate::pipeline::loaders::{mirror_repository, RecordLoader};
use crate::pipeline::transformers::{
    EntityAttributesTransformer, ProhibitedAttributesTransformer, SliceKeysTransformer,
};
use crate::pipeline::{Context, EtlPipeline, Loader};
use crate::storage::entities::{self, LocalReference};
use crate::storage::records;

pub const PROJECT: &str = "project";
pub const REPOSITORY: &str = "repository";
pub const ISSUES: &str = "issues";

/// Creates the destination project. Stage 0 of every project entity.
pub fn project() -> EtlPipeline {
    EtlPipeline::new(PROJECT, RestExtractor::entity(), ProjectLoader)
        .transformer(EntityAttributesTransformer::new(&[
            "name",
            "description",
            "visibility",
            "default_branch",
            "issues_enabled",
            "wiki_enabled",
        ]))
        .fail_fast()
}

/// Mirrors the project's git repository.
pub fn repository() -> EtlPipeline {
    EtlPipeline::new(REPOSITORY, RestExtractor::entity(), RepositoryLoader)
        .transformer(SliceKeysTransformer::new(&["http_url_to_repo"]))
        .fail_fast()
}

pub fn issues() -> EtlPipeline {
    EtlPipeline::new(ISSUES, RestExtractor::collection("issues"), RecordLoader::new("iid"))
        .transformer(ProhibitedAttributesTransformer)
}

struct ProjectLoader;

impl Loader for ProjectLoader {
    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            let full_path = ctx.entity.destination_full_path();
            let id =
                records::upsert_record(&ctx.db, ctx.entity.id, &ctx.tracker.relation, &full_path, &item)
                    .await?;
            entities::set_local_reference(&ctx.db, ctx.entity.id, LocalReference::Project(id))
                .await?;

            info!(entity_id = ctx.entity.id, "[PIPELINE] Created project {}", full_path);
            Ok(())
        })
    }
}

struct RepositoryLoader;

impl Loader for RepositoryLoader {
    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            // Empty projects have nothing to fetch
            let Some(url) = item.get("http_url_to_repo").and_then(Value::as_str) else {
                return Ok(());
            };
            mirror_repository(ctx, url, &ctx.entity.destination_full_path()).await
        })
    }
}
