//! Wiki mirroring, shared by projects and groups.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use crate::error::ImportError;
use crate::pipeline::loaders::mirror_repository;
use crate::pipeline::transformers::SliceKeysTransformer;
use crate::pipeline::{Context, ExtractedData, Pipeline, Transformer};

pub const WIKI: &str = "wiki";

/// Mirrors the source wiki repository, if the source has any wiki pages.
///
/// One unit of work per run: no pagination and no per-item loop.
pub struct WikiPipeline {
    transformers: Vec<Box<dyn Transformer>>,
}

impl Default for WikiPipeline {
    fn default() -> Self {
        Self {
            transformers: vec![Box::new(SliceKeysTransformer::new(&["url"]))],
        }
    }
}

impl WikiPipeline {
    /// Clone URL of the source wiki.
    pub fn source_wiki_url(ctx: &Context) -> String {
        let base = ctx.source.source_url().as_str().trim_end_matches('/');
        let prefix = if ctx.entity.is_group() { "/groups" } else { "" };
        format!("{base}{prefix}/{}.wiki.git", ctx.entity.source_full_path)
    }
}

impl Pipeline for WikiPipeline {
    fn name(&self) -> &'static str {
        WIKI
    }

    fn extract<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<ExtractedData, ImportError>> {
        Box::pin(async move {
            let has_pages = match ctx.source.get(&ctx.entity.wikis_url_path()).await {
                Ok(Value::Array(pages)) => !pages.is_empty(),
                Ok(_) => false,
                // Wiki disabled on the source
                Err(ImportError::NotFound(_)) => false,
                Err(e) => return Err(e),
            };

            let url = has_pages.then(|| Self::source_wiki_url(ctx));
            Ok(ExtractedData::single(json!({ "url": url })))
        })
    }

    fn transformers(&self) -> &[Box<dyn Transformer>] {
        &self.transformers
    }

    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            let Some(url) = item.get("url").and_then(Value::as_str) else {
                return Ok(());
            };
            let destination = format!("{}.wiki", ctx.entity.destination_full_path());
            mirror_repository(ctx, url, &destination).await
        })
    }

    fn abort_on_failure(&self) -> bool {
        true
    }
}
