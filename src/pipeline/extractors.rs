//! Extractors reading from the source API.

use futures_util::future::BoxFuture;

use crate::error::ImportError;
use crate::pipeline::{Context, ExtractedData, Extractor};

/// Reads the entity's own resource or one of its sub-collections.
///
/// Paths are relative to the entity's base resource, e.g. `labels` becomes
/// `/groups/foo%2Fbar/labels`.
#[derive(Debug, Clone)]
pub struct RestExtractor {
    resource: Option<&'static str>,
    paginated: bool,
}

impl RestExtractor {
    /// The entity itself, as one item.
    pub fn entity() -> Self {
        Self { resource: None, paginated: false }
    }

    /// A paginated sub-collection; one page per run.
    pub fn collection(resource: &'static str) -> Self {
        Self { resource: Some(resource), paginated: true }
    }

    pub fn path(&self, ctx: &Context) -> String {
        let base = ctx.entity.base_resource_url_path();
        match self.resource {
            Some(resource) => format!("{base}/{resource}"),
            None => base,
        }
    }
}

impl Extractor for RestExtractor {
    fn extract<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<ExtractedData, ImportError>> {
        Box::pin(async move {
            let path = self.path(ctx);

            if !self.paginated {
                let item = ctx.source.get(&path).await?;
                return Ok(ExtractedData::single(item));
            }

            let page = ctx
                .source
                .get_page(&path, ctx.next_page(), ctx.page_size)
                .await?;
            Ok(ExtractedData::new(page.items, page.next_page))
        })
    }
}
