//! Group-only pipelines.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use crate::entity::{NewEntity, SourceType};
use crate::error::ImportError;
use crate::pipeline::extractors::RestExtractor;
use crate::pipeline::loaders::RecordLoader;
use crate::pipeline::transformers::{EntityAttributesTransformer, MemberAttributesTransformer};
use crate::pipeline::{Context, EtlPipeline, Loader, Transformer};
use crate::storage::entities::{self, LocalReference};
use crate::storage::records;

pub const GROUP: &str = "group";
pub const SUBGROUP_ENTITIES: &str = "subgroup_entities";
pub const PROJECT_ENTITIES: &str = "project_entities";
pub const MEMBERS: &str = "members";

/// Creates the destination group. Stage 0 of every group entity.
pub fn group() -> EtlPipeline {
    EtlPipeline::new(GROUP, RestExtractor::entity(), GroupLoader)
        .transformer(EntityAttributesTransformer::new(&[
            "name",
            "description",
            "visibility",
            "lfs_enabled",
            "request_access_enabled",
        ]))
        .fail_fast()
}

/// Registers the group's subgroups as entities of the same import.
pub fn subgroup_entities() -> EtlPipeline {
    EtlPipeline::new(
        SUBGROUP_ENTITIES,
        RestExtractor::collection("subgroups"),
        ChildEntityLoader::new(SourceType::GroupEntity),
    )
    .transformer(ChildEntityTransformer::new("full_path"))
}

/// Registers the group's projects as entities of the same import.
pub fn project_entities() -> EtlPipeline {
    EtlPipeline::new(
        PROJECT_ENTITIES,
        RestExtractor::collection("projects"),
        ChildEntityLoader::new(SourceType::ProjectEntity),
    )
    .transformer(ChildEntityTransformer::new("path_with_namespace"))
}

pub fn members() -> EtlPipeline {
    EtlPipeline::new(MEMBERS, RestExtractor::collection("members"), RecordLoader::new("username"))
        .transformer(MemberAttributesTransformer)
}

// ─────────────────────────────────────────────────────────────────────────────
// GroupLoader
// ─────────────────────────────────────────────────────────────────────────────

/// Stores the group and links the entity to it.
struct GroupLoader;

impl Loader for GroupLoader {
    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            let full_path = ctx.entity.destination_full_path();
            let id =
                records::upsert_record(&ctx.db, ctx.entity.id, &ctx.tracker.relation, &full_path, &item)
                    .await?;
            entities::set_local_reference(&ctx.db, ctx.entity.id, LocalReference::Group(id)).await?;

            info!(entity_id = ctx.entity.id, "[PIPELINE] Created group {}", full_path);
            Ok(())
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Child entities
// ─────────────────────────────────────────────────────────────────────────────

/// Reduces a subgroup or project to `{source_full_path, destination_name}`.
struct ChildEntityTransformer {
    full_path_key: &'static str,
}

impl ChildEntityTransformer {
    fn new(full_path_key: &'static str) -> Self {
        Self { full_path_key }
    }
}

impl Transformer for ChildEntityTransformer {
    fn transform(&self, _ctx: &Context, item: Value) -> Result<Option<Value>, ImportError> {
        let full_path = item.get(self.full_path_key).and_then(Value::as_str);
        let path = item.get("path").and_then(Value::as_str);

        match (full_path, path) {
            (Some(full_path), Some(path)) if !full_path.is_empty() && !path.is_empty() => {
                Ok(Some(json!({
                    "source_full_path": full_path,
                    "destination_name": path,
                })))
            }
            _ => Ok(None),
        }
    }
}

/// Registers a child entity under the current one, at most once.
struct ChildEntityLoader {
    source_type: SourceType,
}

impl ChildEntityLoader {
    fn new(source_type: SourceType) -> Self {
        Self { source_type }
    }
}

impl Loader for ChildEntityLoader {
    fn load<'a>(&'a self, ctx: &'a Context, item: Value) -> BoxFuture<'a, Result<(), ImportError>> {
        Box::pin(async move {
            let field = |key: &str| -> Result<String, ImportError> {
                item.get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ImportError::Validation(format!("{key} can't be blank")))
            };
            let source_full_path = field("source_full_path")?;
            let destination_name = field("destination_name")?;

            if entities::find_child_entity(&ctx.db, ctx.entity.id, &source_full_path)
                .await?
                .is_some()
            {
                return Ok(());
            }

            let child = NewEntity {
                bulk_import_id: ctx.entity.bulk_import_id.clone(),
                parent_id: Some(ctx.entity.id),
                source_type: self.source_type,
                source_full_path,
                destination_namespace: ctx.entity.destination_full_path(),
                destination_name,
                source_version: ctx.entity.source_version.clone(),
            };
            ctx.registrar.register(&ctx.db, child).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::runner::{RetryPolicy, RunOutcome, Runner};
    use crate::storage::trackers;
    use crate::test_support::{seed_group, test_context, test_db};
    use crate::tracker::TrackerEvent;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    async fn run(pipeline: &EtlPipeline, ctx: &Context) -> RunOutcome {
        trackers::apply_event(&ctx.db, ctx.tracker.id, TrackerEvent::Enqueue, None)
            .await
            .unwrap();
        Runner::new(pipeline, ctx, &policy()).run(0).await.unwrap()
    }

    #[tokio::test]
    async fn group_pipeline_links_local_group() {
        let (_dir, db) = test_db().await;
        let server = MockServer::start().await;
        let entity = seed_group(&db, "foo").await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/foo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 10, "name": "Foo", "path": "foo", "description": "d", "visibility": "private"
            })))
            .mount(&server)
            .await;

        let ctx = test_context(&db, &server.uri(), entity, GROUP).await;
        assert_eq!(run(&group(), &ctx).await, RunOutcome::Finished);

        let stored = records::get_record(&db, ctx.entity.id, GROUP, "foo").await.unwrap().unwrap();
        assert_eq!(stored.payload["name"], "Foo");
        assert_eq!(stored.payload["full_path"], "foo");

        let entity = entities::find_entity(&db, ctx.entity.id).await.unwrap();
        assert_eq!(entity.group_id, Some(stored.id));
    }

    #[tokio::test]
    async fn subgroups_are_registered_once() {
        let (_dir, db) = test_db().await;
        let server = MockServer::start().await;
        let entity = seed_group(&db, "foo").await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/foo/subgroups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 2, "path": "bar", "full_path": "foo/bar"},
                {"id": 3, "name": "no path"},
            ])))
            .mount(&server)
            .await;

        let ctx = test_context(&db, &server.uri(), entity, SUBGROUP_ENTITIES).await;
        let pipeline = subgroup_entities();
        assert_eq!(run(&pipeline, &ctx).await, RunOutcome::Finished);

        // Redelivered page
        let replay = test_context(&db, &server.uri(), ctx.entity.clone(), "subgroup_entities_replay").await;
        trackers::apply_event(&db, replay.tracker.id, TrackerEvent::Enqueue, None).await.unwrap();
        Runner::new(&pipeline, &replay, &policy()).run(0).await.unwrap();

        let all = entities::list_entities(&db, &ctx.entity.bulk_import_id).await.unwrap();
        assert_eq!(all.len(), 2);

        let child = &all[1];
        assert_eq!(child.parent_id, Some(ctx.entity.id));
        assert_eq!(child.source_type, SourceType::GroupEntity);
        assert_eq!(child.source_full_path, "foo/bar");
        assert_eq!(child.destination_namespace, "foo");
        assert_eq!(child.destination_name, "bar");
        assert_eq!(child.source_version.as_deref(), Some("15.0.0"));

        let child_trackers = trackers::list_trackers(&db, child.id).await.unwrap();
        assert!(child_trackers.iter().any(|t| t.relation == GROUP && t.stage == 0));
    }

    #[tokio::test]
    async fn projects_are_registered_under_group_destination() {
        let (_dir, db) = test_db().await;
        let server = MockServer::start().await;
        let entity = seed_group(&db, "foo").await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/foo/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 7, "path": "app", "path_with_namespace": "foo/app"},
            ])))
            .mount(&server)
            .await;

        let ctx = test_context(&db, &server.uri(), entity, PROJECT_ENTITIES).await;
        assert_eq!(run(&project_entities(), &ctx).await, RunOutcome::Finished);

        let child = entities::find_child_entity(&db, ctx.entity.id, "foo/app")
            .await
            .unwrap()
            .unwrap();
        assert!(child.is_project());
        assert_eq!(child.destination_full_path(), "foo/app");
        assert!(trackers::list_trackers(&db, child.id)
            .await
            .unwrap()
            .iter()
            .any(|t| t.relation == "repository"));
    }

    #[tokio::test]
    async fn members_keyed_by_username() {
        let (_dir, db) = test_db().await;
        let server = MockServer::start().await;
        let entity = seed_group(&db, "foo").await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/foo/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "username": "jane", "access_level": 30},
                {"id": 2, "username": "bot", "access_level": 0},
            ])))
            .mount(&server)
            .await;

        let ctx = test_context(&db, &server.uri(), entity, MEMBERS).await;
        assert_eq!(run(&members(), &ctx).await, RunOutcome::Finished);

        let stored = records::list_records(&db, ctx.entity.id, MEMBERS).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].source_key, "jane");
    }
}
