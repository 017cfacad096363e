//! Shared helpers for unit tests.

use std::collections::HashMap;
use std::time::Duration;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use secrecy::SecretString;
use tempfile::TempDir;
use url::Url;

use crate::config::{StagesConfig, UrlPolicyConfig};
use crate::entity::{Entity, NewEntity, SourceType};
use crate::error::ImportError;
use crate::pipeline::Context;
use crate::queue::{JobQueue, PipelineJob};
use crate::registry::{EntityRegistrar, PipelineRegistry};
use crate::repository::{GitCredentials, RepositoryStore};
use crate::source::SourceClient;
use crate::stage::StageBuilder;
use crate::storage::entities::insert_entity;
use crate::storage::imports::create_import;
use crate::storage::trackers::create_trackers;
use crate::storage::Database;
use crate::tracker::NewTracker;
use crate::validation::UrlBlocker;

pub async fn test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::init(temp_dir.path().join("test.db"))
        .await
        .expect("Failed to init database");
    (temp_dir, db)
}

fn last_segment(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

pub fn new_group_entity(bulk_import_id: &str, source_full_path: &str) -> NewEntity {
    NewEntity {
        bulk_import_id: bulk_import_id.to_string(),
        parent_id: None,
        source_type: SourceType::GroupEntity,
        source_full_path: source_full_path.to_string(),
        destination_namespace: String::new(),
        destination_name: last_segment(source_full_path),
        source_version: Some("15.0.0".to_string()),
    }
}

pub fn new_project_entity(bulk_import_id: &str, source_full_path: &str) -> NewEntity {
    NewEntity {
        bulk_import_id: bulk_import_id.to_string(),
        parent_id: None,
        source_type: SourceType::ProjectEntity,
        source_full_path: source_full_path.to_string(),
        destination_namespace: "imported".to_string(),
        destination_name: last_segment(source_full_path),
        source_version: Some("15.0.0".to_string()),
    }
}

/// Creates an import with a single top-level group entity.
pub async fn seed_group(db: &Database, source_full_path: &str) -> Entity {
    let import = create_import(db, "https://source.example.com", Some("15.0.0"))
        .await
        .expect("Failed to create import");
    insert_entity(db, new_group_entity(&import.id, source_full_path))
        .await
        .expect("Failed to insert entity")
}

/// Creates an import with a single project entity.
pub async fn seed_project(db: &Database, source_full_path: &str) -> Entity {
    let import = create_import(db, "https://source.example.com", Some("15.0.0"))
        .await
        .expect("Failed to create import");
    insert_entity(db, new_project_entity(&import.id, source_full_path))
        .await
        .expect("Failed to insert entity")
}

/// Overwrites a tracker's `updated_at`, bypassing the state machine.
pub async fn touch_tracker(db: &Database, tracker_id: i64, updated_at: i64) {
    db.blocking("Touch tracker", move |conn| {
        conn.execute(
            "UPDATE trackers SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![updated_at, tracker_id],
        )
        .map_err(|e| ImportError::Internal(e.to_string()))?;
        Ok(())
    })
    .await
    .expect("Failed to touch tracker");
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline context and fakes
// ─────────────────────────────────────────────────────────────────────────────

pub const TEST_TOKEN: &str = "glpat-test";

/// Repository store that records calls instead of running git.
///
/// `fetched` holds the destination path, the fetch URL and the
/// authorization header, if any.
#[derive(Default)]
pub struct FakeRepositoryStore {
    pub ensured: Mutex<Vec<String>>,
    pub fetched: Mutex<Vec<(String, String, Option<String>)>>,
}

impl RepositoryStore for FakeRepositoryStore {
    fn ensure_repository<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<(), ImportError>> {
        self.ensured.lock().unwrap().push(path.to_string());
        Box::pin(async { Ok(()) })
    }

    fn fetch_as_mirror<'a>(
        &'a self,
        path: &'a str,
        url: &'a Url,
        credentials: Option<&'a GitCredentials>,
    ) -> BoxFuture<'a, Result<(), ImportError>> {
        self.fetched.lock().unwrap().push((
            path.to_string(),
            url.to_string(),
            credentials.map(GitCredentials::authorization_header),
        ));
        Box::pin(async { Ok(()) })
    }
}

/// Queue that records jobs instead of running them.
#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<(PipelineJob, Option<Duration>)>>,
}

impl RecordingQueue {
    /// Drains the recorded jobs.
    pub fn take(&self) -> Vec<PipelineJob> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
            .into_iter()
            .map(|(job, _)| job)
            .collect()
    }

    pub fn take_with_delays(&self) -> Vec<(PipelineJob, Option<Duration>)> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: PipelineJob) -> BoxFuture<'_, Result<(), ImportError>> {
        self.jobs.lock().unwrap().push((job, None));
        Box::pin(async { Ok(()) })
    }

    fn enqueue_in(&self, job: PipelineJob, delay: Duration) -> BoxFuture<'_, Result<(), ImportError>> {
        self.jobs.lock().unwrap().push((job, Some(delay)));
        Box::pin(async { Ok(()) })
    }
}

/// URL policy of tests: wiremock servers listen on 127.0.0.1.
pub fn test_url_policy() -> UrlPolicyConfig {
    UrlPolicyConfig {
        allow_localhost: true,
        ..UrlPolicyConfig::default()
    }
}

pub fn test_registrar() -> EntityRegistrar {
    EntityRegistrar::new(
        StageBuilder::standard(&StagesConfig::default()),
        HashMap::new(),
        PipelineRegistry::standard(),
    )
}

pub fn test_source(source_url: &str) -> SourceClient {
    SourceClient::new(
        source_url,
        SecretString::from(TEST_TOKEN.to_string()),
        Duration::from_secs(5),
    )
    .expect("Failed to build source client")
}

/// Context for running `relation` against `entity`, with a fresh stage-1 tracker.
pub async fn test_context(
    db: &Database,
    source_url: &str,
    entity: Entity,
    relation: &str,
) -> Context {
    test_context_with_store(db, source_url, entity, relation, Arc::new(FakeRepositoryStore::default()))
        .await
}

pub async fn test_context_with_store(
    db: &Database,
    source_url: &str,
    entity: Entity,
    relation: &str,
    repositories: Arc<dyn RepositoryStore>,
) -> Context {
    let tracker = create_trackers(
        db,
        entity.id,
        vec![NewTracker {
            entity_id: entity.id,
            relation: relation.to_string(),
            stage: 1,
        }],
    )
    .await
    .expect("Failed to create tracker")
    .remove(0);

    Context {
        db: db.clone(),
        source: test_source(source_url),
        entity,
        tracker,
        repositories,
        url_blocker: Arc::new(UrlBlocker::new(test_url_policy())),
        registrar: Arc::new(test_registrar()),
        page_size: 100,
    }
}
