//! Pipeline workers.
//!
//! A [`WorkerPool`] pulls jobs off the queue and runs each one in its own
//! task, bounded by a [`WorkerScheduler`]. Every finished job re-triggers
//! stage dispatch for its entity.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::entity::EntityStatus;
use crate::error::ImportError;
use crate::orchestrator::Orchestrator;
use crate::pipeline::runner::{RetryPolicy, RunOutcome, Runner};
use crate::pipeline::Context;
use crate::queue::{JobQueue, JobReceiver, PipelineJob};
use crate::registry::EntityRegistrar;
use crate::repository::RepositoryStore;
use crate::source::SourceClient;
use crate::storage::failures::{self, PipelineStep};
use crate::storage::{entities, trackers, Database};
use crate::tracker::{TrackerEvent, TrackerStatus};
use crate::validation::UrlBlocker;

// ─────────────────────────────────────────────────────────────────────────────
// WorkerScheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Limits the number of pipelines running at once.
#[derive(Clone)]
pub struct WorkerScheduler {
    sem: Arc<Semaphore>,
    max: usize,
}

impl WorkerScheduler {
    /// A limit of 0 is raised to 1.
    pub fn new(max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            sem: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Waits for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<WorkerPermit, ImportError> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ImportError::Cancelled)?;
        Ok(WorkerPermit { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<WorkerPermit> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerPermit { _permit: permit })
    }

    pub fn active_jobs(&self) -> usize {
        self.max - self.sem.available_permits()
    }

    pub fn available_slots(&self) -> usize {
        self.sem.available_permits()
    }
}

/// An occupied worker slot.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

// ─────────────────────────────────────────────────────────────────────────────
// PipelineWorker
// ─────────────────────────────────────────────────────────────────────────────

/// What a job ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Ran(RunOutcome),
    /// The tracker was not waiting to run; only dispatch was re-triggered.
    Dropped,
    /// The owning entity had failed, so the tracker was failed unrun.
    EntityFailed,
    /// The job itself errored; the tracker was failed.
    Errored,
}

/// Runs one tracker's pipeline per job.
pub struct PipelineWorker {
    pub db: Database,
    pub source: SourceClient,
    pub repositories: Arc<dyn RepositoryStore>,
    pub url_blocker: Arc<UrlBlocker>,
    pub registrar: Arc<EntityRegistrar>,
    pub queue: Arc<dyn JobQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pub policy: RetryPolicy,
    pub page_size: u32,
}

impl PipelineWorker {
    /// Runs the job, then re-triggers dispatch for its entity.
    ///
    /// Job errors are recorded against the tracker; only storage errors
    /// while doing so are returned.
    pub async fn perform(&self, job: PipelineJob) -> Result<JobOutcome, ImportError> {
        let outcome = match self.run_job(&job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_job(&job, &e).await?;
                JobOutcome::Errored
            }
        };

        if let Some(entity) = entities::get_entity(&self.db, job.entity_id).await? {
            self.orchestrator.dispatch_next(&entity, Some(job.stage)).await?;
        }

        Ok(outcome)
    }

    async fn run_job(&self, job: &PipelineJob) -> Result<JobOutcome, ImportError> {
        let tracker = trackers::get_tracker(&self.db, job.tracker_id)
            .await?
            .filter(|t| matches!(t.status, TrackerStatus::Enqueued | TrackerStatus::Started));
        let Some(tracker) = tracker else {
            info!(
                entity_id = job.entity_id,
                tracker_id = job.tracker_id,
                stage = job.stage,
                "[WORKER] Unstarted pipeline not found"
            );
            return Ok(JobOutcome::Dropped);
        };

        let entity = entities::find_entity(&self.db, tracker.entity_id).await?;
        if entity.status == EntityStatus::Failed {
            let error = ImportError::Validation("Failed entity status".into());
            failures::record_failure(
                &self.db,
                entity.id,
                &tracker.relation,
                PipelineStep::PipelineWorkerRun,
                &error,
                &job.jid,
            )
            .await?;
            fail_tracker(&self.db, tracker.id).await?;
            return Ok(JobOutcome::EntityFailed);
        }

        // The tracker may reference a pipeline the entity no longer declares
        let declared = self.registrar.pipeline_exists(&entity, &tracker.relation)?;
        let pipeline = declared
            .then(|| self.registrar.registry().get(&tracker.relation))
            .flatten()
            .ok_or_else(|| ImportError::Configuration(format!("Pipeline {} not found", tracker.relation)))?;

        trackers::set_jid(&self.db, tracker.id, &job.jid).await?;

        let ctx = Context {
            db: self.db.clone(),
            source: self.source.clone(),
            entity,
            tracker,
            repositories: self.repositories.clone(),
            url_blocker: self.url_blocker.clone(),
            registrar: self.registrar.clone(),
            page_size: self.page_size,
        };

        let outcome = Runner::new(pipeline.as_ref(), &ctx, &self.policy)
            .run(job.attempt)
            .await?;

        match &outcome {
            RunOutcome::NextPage => self.queue.enqueue(job.next_page()).await?,
            RunOutcome::Retry { delay } => self.queue.enqueue_in(job.retry(), *delay).await?,
            RunOutcome::Failed if pipeline.abort_on_failure() => {
                warn!(
                    entity_id = ctx.entity.id,
                    tracker_id = ctx.tracker.id,
                    pipeline_name = pipeline.name(),
                    "[WORKER] Failing {} {}",
                    ctx.entity.entity_type(),
                    ctx.entity.source_full_path
                );
                entities::update_entity_status(&self.db, ctx.entity.id, EntityStatus::Failed).await?;
            }
            _ => {}
        }

        Ok(JobOutcome::Ran(outcome))
    }

    async fn fail_job(&self, job: &PipelineJob, err: &ImportError) -> Result<(), ImportError> {
        error!(
            entity_id = job.entity_id,
            tracker_id = job.tracker_id,
            stage = job.stage,
            "[WORKER] Job failed: {}",
            err.sanitized_message()
        );

        let relation = trackers::get_tracker(&self.db, job.tracker_id)
            .await?
            .map(|t| t.relation)
            .unwrap_or_default();
        failures::record_failure(
            &self.db,
            job.entity_id,
            &relation,
            PipelineStep::PipelineWorkerRun,
            err,
            &job.jid,
        )
        .await?;

        fail_tracker(&self.db, job.tracker_id).await
    }
}

async fn fail_tracker(db: &Database, tracker_id: i64) -> Result<(), ImportError> {
    match trackers::apply_event(db, tracker_id, TrackerEvent::Fail, None).await {
        Ok(_) | Err(ImportError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WorkerPool
// ─────────────────────────────────────────────────────────────────────────────

pub struct WorkerPool {
    worker: Arc<PipelineWorker>,
    scheduler: WorkerScheduler,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(worker: Arc<PipelineWorker>, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            worker,
            scheduler: WorkerScheduler::new(concurrency),
            cancel,
        }
    }

    /// Runs jobs until cancelled or the queue closes, then waits for
    /// in-flight jobs.
    pub async fn run(self, mut jobs: JobReceiver) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.scheduler.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.worker.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let tracker_id = job.tracker_id;
                if let Err(e) = worker.perform(job).await {
                    error!(tracker_id, "[WORKER] Failed to settle job: {}", e.sanitized_message());
                }
            });

            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!("[WORKER] Job task panicked: {e}");
                }
            }
        }

        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("[WORKER] Job task panicked: {e}");
            }
        }
        info!("[WORKER] Pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::entity::Entity;
    use crate::test_support::{
        seed_group, test_db, test_registrar, test_source, test_url_policy, FakeRepositoryStore,
        RecordingQueue,
    };
    use crate::tracker::NewTracker;

    #[test]
    fn scheduler_limits_slots() {
        let scheduler = WorkerScheduler::new(2);
        let a = scheduler.try_acquire();
        let b = scheduler.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(scheduler.try_acquire().is_none());
        assert_eq!(scheduler.active_jobs(), 2);

        drop(a);
        assert_eq!(scheduler.available_slots(), 1);
        assert!(scheduler.try_acquire().is_some());
    }

    #[test]
    fn scheduler_has_at_least_one_slot() {
        assert_eq!(WorkerScheduler::new(0).available_slots(), 1);
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        queue: Arc<RecordingQueue>,
        worker: PipelineWorker,
        entity: Entity,
    }

    async fn fixture(source_url: &str) -> Fixture {
        let (dir, db) = test_db().await;
        let entity = seed_group(&db, "foo").await;
        let queue = Arc::new(RecordingQueue::default());
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            queue.clone(),
            Duration::from_secs(3600),
        ));

        let worker = PipelineWorker {
            db: db.clone(),
            source: test_source(source_url),
            repositories: Arc::new(FakeRepositoryStore::default()),
            url_blocker: Arc::new(UrlBlocker::new(test_url_policy())),
            registrar: Arc::new(test_registrar()),
            queue: queue.clone(),
            orchestrator,
            policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
            page_size: 1,
        };

        Fixture { _dir: dir, db, queue, worker, entity }
    }

    /// Creates and enqueues a single stage-0 tracker.
    async fn enqueued_job(f: &Fixture, relation: &str) -> PipelineJob {
        let tracker = trackers::create_trackers(
            &f.db,
            f.entity.id,
            vec![NewTracker {
                entity_id: f.entity.id,
                relation: relation.to_string(),
                stage: 0,
            }],
        )
        .await
        .unwrap()
        .remove(0);
        trackers::apply_event(&f.db, tracker.id, TrackerEvent::Enqueue, None).await.unwrap();
        PipelineJob::new(tracker.id, f.entity.id, 0)
    }

    async fn status(f: &Fixture, tracker_id: i64) -> TrackerStatus {
        trackers::get_tracker(&f.db, tracker_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn job_for_resolved_tracker_is_dropped() {
        let f = fixture("https://source.example.com").await;
        let job = enqueued_job(&f, "labels").await;
        trackers::apply_event(&f.db, job.tracker_id, TrackerEvent::Skip, None).await.unwrap();

        assert_eq!(f.worker.perform(job.clone()).await.unwrap(), JobOutcome::Dropped);
        assert_eq!(status(&f, job.tracker_id).await, TrackerStatus::Skipped);
    }

    #[tokio::test]
    async fn failed_entity_fails_tracker_unrun() {
        let f = fixture("https://source.example.com").await;
        let job = enqueued_job(&f, "labels").await;
        entities::update_entity_status(&f.db, f.entity.id, EntityStatus::Failed).await.unwrap();

        assert_eq!(f.worker.perform(job.clone()).await.unwrap(), JobOutcome::EntityFailed);
        assert_eq!(status(&f, job.tracker_id).await, TrackerStatus::Failed);

        let recorded = failures::list_failures(&f.db, f.entity.id).await.unwrap();
        assert_eq!(recorded[0].exception_message, "Validation failed: Failed entity status");
        assert_eq!(recorded[0].pipeline_step, "pipeline_worker_run");
    }

    #[tokio::test]
    async fn next_page_is_enqueued_immediately() {
        let server = MockServer::start().await;
        let f = fixture(&server.uri()).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/foo/labels"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "2")
                    .set_body_json(json!([{"title": "bug"}])),
            )
            .mount(&server)
            .await;

        let job = enqueued_job(&f, "labels").await;
        let outcome = f.worker.perform(job.clone()).await.unwrap();

        assert_eq!(outcome, JobOutcome::Ran(RunOutcome::NextPage));
        let queued = f.queue.take_with_delays();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0.tracker_id, job.tracker_id);
        assert_eq!(queued[0].1, None);

        let tracker = trackers::get_tracker(&f.db, job.tracker_id).await.unwrap().unwrap();
        assert_eq!(tracker.next_page.as_deref(), Some("2"));
        assert_eq!(tracker.jid.as_deref(), Some(job.jid.as_str()));
    }

    #[tokio::test]
    async fn transient_error_is_retried_after_delay() {
        let server = MockServer::start().await;
        let f = fixture(&server.uri()).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/foo/labels"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let job = enqueued_job(&f, "labels").await;
        let outcome = f.worker.perform(job.clone()).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Ran(RunOutcome::Retry { .. })));
        let queued = f.queue.take_with_delays();
        assert_eq!(queued[0].0.attempt, 1);
        assert!(queued[0].1.is_some());
        assert_eq!(status(&f, job.tracker_id).await, TrackerStatus::Enqueued);
    }

    #[tokio::test]
    async fn failed_stage_zero_fails_entity() {
        let server = MockServer::start().await;
        let f = fixture(&server.uri()).await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/foo"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let job = enqueued_job(&f, "group").await;
        let outcome = f.worker.perform(job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Ran(RunOutcome::Failed));
        let entity = entities::find_entity(&f.db, f.entity.id).await.unwrap();
        assert_eq!(entity.status, EntityStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_pipeline_errors_job() {
        let f = fixture("https://source.example.com").await;
        let job = enqueued_job(&f, "no_such_pipeline").await;

        assert_eq!(f.worker.perform(job.clone()).await.unwrap(), JobOutcome::Errored);
        assert_eq!(status(&f, job.tracker_id).await, TrackerStatus::Failed);
        let recorded = failures::list_failures(&f.db, f.entity.id).await.unwrap();
        assert_eq!(recorded[0].exception_class, "Configuration");
    }

    #[tokio::test]
    async fn pipeline_not_declared_by_entity_errors_job() {
        let f = fixture("https://source.example.com").await;
        // Registered globally, but groups only get a wiki when enabled
        assert!(f.worker.registrar.registry().contains("wiki"));
        assert!(!f.worker.registrar.pipeline_exists(&f.entity, "wiki").unwrap());

        let job = enqueued_job(&f, "wiki").await;
        assert_eq!(f.worker.perform(job.clone()).await.unwrap(), JobOutcome::Errored);
        assert_eq!(status(&f, job.tracker_id).await, TrackerStatus::Failed);

        let recorded = failures::list_failures(&f.db, f.entity.id).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].exception_class, "Configuration");
        assert_eq!(recorded[0].pipeline_class, "wiki");
    }
}
