//! Extract → transform → load pipelines.
//!
//! A pipeline is bound to one tracker at run time through [`Context`]. The
//! [`runner`] drives it and translates its outcome into tracker events.

pub mod common;
pub mod extractors;
pub mod loaders;
pub mod runner;
pub mod transformers;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Entity;
use crate::error::ImportError;
use crate::registry::EntityRegistrar;
use crate::repository::RepositoryStore;
use crate::source::SourceClient;
use crate::storage::Database;
use crate::tracker::Tracker;
use crate::validation::UrlBlocker;

// ─────────────────────────────────────────────────────────────────────────────
// ExtractedData
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub next_page: Option<String>,
}

/// One batch returned by an extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub data: Vec<Value>,
    pub page_info: PageInfo,
}

impl ExtractedData {
    pub fn new(data: Vec<Value>, next_page: Option<String>) -> Self {
        Self {
            data,
            page_info: PageInfo {
                has_next_page: next_page.is_some(),
                next_page,
            },
        }
    }

    /// A single, unpaginated item.
    pub fn single(item: Value) -> Self {
        Self::new(vec![item], None)
    }

    pub fn has_next_page(&self) -> bool {
        self.page_info.has_next_page
    }

    pub fn next_page(&self) -> Option<&str> {
        self.page_info.next_page.as_deref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a pipeline run may touch.
#[derive(Clone)]
pub struct Context {
    pub db: Database,
    pub source: SourceClient,
    pub entity: Entity,
    pub tracker: Tracker,
    pub repositories: Arc<dyn RepositoryStore>,
    pub url_blocker: Arc<UrlBlocker>,
    pub registrar: Arc<EntityRegistrar>,
    pub page_size: u32,
}

impl Context {
    /// Cursor to resume extraction from.
    pub fn next_page(&self) -> Option<&str> {
        self.tracker.next_page.as_deref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

pub trait Extractor: Send + Sync {
    fn extract<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<ExtractedData, ImportError>>;
}

/// Pure per-item normalization. `Ok(None)` drops the item.
pub trait Transformer: Send + Sync {
    fn transform(&self, ctx: &Context, item: Value) -> Result<Option<Value>, ImportError>;
}

/// Persists one item. Must tolerate the same item being loaded twice.
pub trait Loader: Send + Sync {
    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>>;
}

/// A named unit of work run against one entity.
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<ExtractedData, ImportError>>;

    /// Applied to every item, in order.
    fn transformers(&self) -> &[Box<dyn Transformer>];

    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>>;

    /// Fail the tracker on the first item error instead of continuing.
    fn abort_on_failure(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EtlPipeline
// ─────────────────────────────────────────────────────────────────────────────

/// A pipeline assembled from an extractor, transformers and a loader.
pub struct EtlPipeline {
    name: &'static str,
    extractor: Box<dyn Extractor>,
    transformers: Vec<Box<dyn Transformer>>,
    loader: Box<dyn Loader>,
    abort_on_failure: bool,
}

impl EtlPipeline {
    pub fn new(
        name: &'static str,
        extractor: impl Extractor + 'static,
        loader: impl Loader + 'static,
    ) -> Self {
        Self {
            name,
            extractor: Box::new(extractor),
            transformers: Vec::new(),
            loader: Box::new(loader),
            abort_on_failure: false,
        }
    }

    pub fn transformer(mut self, transformer: impl Transformer + 'static) -> Self {
        self.transformers.push(Box::new(transformer));
        self
    }

    /// Fail the tracker on the first item error.
    pub fn fail_fast(mut self) -> Self {
        self.abort_on_failure = true;
        self
    }
}

impl Pipeline for EtlPipeline {
    fn name(&self) -> &'static str {
        self.name
    }

    fn extract<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<ExtractedData, ImportError>> {
        self.extractor.extract(ctx)
    }

    fn transformers(&self) -> &[Box<dyn Transformer>] {
        &self.transformers
    }

    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        self.loader.load(ctx, item)
    }

    fn abort_on_failure(&self) -> bool {
        self.abort_on_failure
    }
}
