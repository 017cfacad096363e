//! Drives one pipeline run and maps its outcome onto tracker events.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::error::ImportError;
use crate::pipeline::{Context, Pipeline};
use crate::storage::failures::{self, PipelineStep};
use crate::storage::trackers;
use crate::tracker::TrackerEvent;

// ─────────────────────────────────────────────────────────────────────────────
// RetryPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Whether a failed attempt (0-based) may be followed by another one.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Delay before retrying after `attempt` failed: `base * 2^attempt`,
    /// capped at `max_delay`, plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay);

        let jitter_ms = (exp.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };

        exp + Duration::from_millis(jitter)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RunOutcome
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The tracker finished, or a finish was absorbed by a terminal status.
    Finished,
    /// More pages remain; the tracker is enqueued with the next cursor.
    NextPage,
    /// A transient failure; the tracker is enqueued for another attempt.
    Retry { delay: Duration },
    /// The tracker was failed.
    Failed,
    /// The tracker was resolved elsewhere (swept or skipped) mid-run.
    Superseded,
}

enum ItemsResult {
    Done,
    Retry(ImportError),
    Abort(ImportError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

pub struct Runner<'a> {
    pipeline: &'a dyn Pipeline,
    ctx: &'a Context,
    policy: &'a RetryPolicy,
    correlation_id: String,
}

impl<'a> Runner<'a> {
    pub fn new(pipeline: &'a dyn Pipeline, ctx: &'a Context, policy: &'a RetryPolicy) -> Self {
        Self {
            pipeline,
            ctx,
            policy,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Runs one dispatch of the pipeline. `attempt` counts consecutive
    /// transient failures of the current page.
    ///
    /// Pipeline errors never escape: they are recorded as failures and turned
    /// into `retry` or `fail_op`. Only storage errors are returned.
    pub async fn run(&self, attempt: u32) -> Result<RunOutcome, ImportError> {
        let ctx = self.ctx;
        let name = self.pipeline.name();

        trackers::apply_event(&ctx.db, ctx.tracker.id, TrackerEvent::Start, None).await?;
        info!(
            entity_id = ctx.entity.id,
            tracker_id = ctx.tracker.id,
            pipeline_name = name,
            stage = ctx.tracker.stage,
            "[PIPELINE] Started"
        );

        let extracted = match self.pipeline.extract(ctx).await {
            Ok(data) => data,
            Err(e) => {
                self.record(PipelineStep::Extractor, &e).await?;
                return if e.is_transient() {
                    self.retry_page(attempt, &e).await
                } else {
                    self.fail(&e).await
                };
            }
        };

        match self.process_items(extracted.data).await? {
            ItemsResult::Done => {}
            ItemsResult::Retry(e) => return self.retry_page(attempt, &e).await,
            ItemsResult::Abort(e) => return self.fail(&e).await,
        }

        if let Some(next_page) = extracted.page_info.next_page {
            return match trackers::apply_event(
                &ctx.db,
                ctx.tracker.id,
                TrackerEvent::Retry,
                Some(next_page),
            )
            .await
            {
                Ok(_) => Ok(RunOutcome::NextPage),
                Err(ImportError::InvalidTransition { .. }) => Ok(self.superseded()),
                Err(e) => Err(e),
            };
        }

        match trackers::apply_event(&ctx.db, ctx.tracker.id, TrackerEvent::Finish, None).await {
            Ok(tracker) => {
                info!(
                    entity_id = ctx.entity.id,
                    tracker_id = ctx.tracker.id,
                    pipeline_name = name,
                    "[PIPELINE] Finished with status {}",
                    tracker.status
                );
                Ok(RunOutcome::Finished)
            }
            Err(ImportError::InvalidTransition { .. }) => Ok(self.superseded()),
            Err(e) => Err(e),
        }
    }

    async fn process_items(&self, items: Vec<Value>) -> Result<ItemsResult, ImportError> {
        for item in items {
            let transformed = match self.transform(item) {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    self.record(PipelineStep::Transformer, &e).await?;
                    if e.is_systemic() || self.pipeline.abort_on_failure() {
                        return Ok(ItemsResult::Abort(e));
                    }
                    continue;
                }
            };

            if let Err(e) = self.pipeline.load(self.ctx, transformed).await {
                self.record(PipelineStep::Loader, &e).await?;
                if e.is_systemic() || self.pipeline.abort_on_failure() {
                    return Ok(ItemsResult::Abort(e));
                }
                if e.is_transient() {
                    return Ok(ItemsResult::Retry(e));
                }
            }
        }

        Ok(ItemsResult::Done)
    }

    fn transform(&self, item: Value) -> Result<Option<Value>, ImportError> {
        let mut current = item;
        for transformer in self.pipeline.transformers() {
            match transformer.transform(self.ctx, current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Re-enqueues the current page, or fails once the attempt budget is spent.
    async fn retry_page(&self, attempt: u32, error: &ImportError) -> Result<RunOutcome, ImportError> {
        let ctx = self.ctx;

        if !self.policy.can_retry(attempt) {
            warn!(
                entity_id = ctx.entity.id,
                tracker_id = ctx.tracker.id,
                pipeline_name = self.pipeline.name(),
                "[PIPELINE] Giving up after {} attempts",
                attempt + 1
            );
            return self.fail(error).await;
        }

        let cursor = ctx.tracker.next_page.clone();
        match trackers::apply_event(&ctx.db, ctx.tracker.id, TrackerEvent::Retry, cursor).await {
            Ok(_) => {
                let delay = error
                    .retry_after()
                    .unwrap_or_else(|| self.policy.delay_for(attempt));
                info!(
                    entity_id = ctx.entity.id,
                    tracker_id = ctx.tracker.id,
                    pipeline_name = self.pipeline.name(),
                    "[PIPELINE] Retrying in {}ms: {}",
                    delay.as_millis(),
                    error.sanitized_message()
                );
                Ok(RunOutcome::Retry { delay })
            }
            Err(ImportError::InvalidTransition { .. }) => Ok(self.superseded()),
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, error: &ImportError) -> Result<RunOutcome, ImportError> {
        let ctx = self.ctx;
        trackers::apply_event(&ctx.db, ctx.tracker.id, TrackerEvent::Fail, None).await?;
        warn!(
            entity_id = ctx.entity.id,
            tracker_id = ctx.tracker.id,
            pipeline_name = self.pipeline.name(),
            "[PIPELINE] Failed: {}",
            error.sanitized_message()
        );
        Ok(RunOutcome::Failed)
    }

    fn superseded(&self) -> RunOutcome {
        info!(
            entity_id = self.ctx.entity.id,
            tracker_id = self.ctx.tracker.id,
            pipeline_name = self.pipeline.name(),
            "[PIPELINE] Tracker resolved elsewhere, dropping result"
        );
        RunOutcome::Superseded
    }

    async fn record(&self, step: PipelineStep, error: &ImportError) -> Result<(), ImportError> {
        failures::record_failure(
            &self.ctx.db,
            self.ctx.entity.id,
            self.pipeline.name(),
            step,
            error,
            &self.correlation_id,
        )
        .await
    }
}
