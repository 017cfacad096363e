//! Importable entities (groups and projects) and their validation rules.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::ImportError;

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[serde(alias = "group")]
    GroupEntity,
    #[serde(alias = "project")]
    ProjectEntity,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::GroupEntity => "group_entity",
            SourceType::ProjectEntity => "project_entity",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group_entity" | "group" => Ok(SourceType::GroupEntity),
            "project_entity" | "project" => Ok(SourceType::ProjectEntity),
            other => Err(ImportError::Validation(format!("unknown source type {other}"))),
        }
    }
}

/// Entity-level import status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Created,
    Started,
    Finished,
    Timeout,
    Failed,
}

impl EntityStatus {
    pub fn code(&self) -> i64 {
        match self {
            EntityStatus::Created => 0,
            EntityStatus::Started => 1,
            EntityStatus::Finished => 2,
            EntityStatus::Timeout => 3,
            EntityStatus::Failed => -1,
        }
    }

    /// Unknown codes fall back to `Created`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => EntityStatus::Started,
            2 => EntityStatus::Finished,
            3 => EntityStatus::Timeout,
            -1 => EntityStatus::Failed,
            _ => EntityStatus::Created,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Created => "created",
            EntityStatus::Started => "started",
            EntityStatus::Finished => "finished",
            EntityStatus::Timeout => "timeout",
            EntityStatus::Failed => "failed",
        }
    }

    pub fn all_human_statuses() -> [&'static str; 5] {
        ["created", "started", "finished", "failed", "timeout"]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntityStatus::Finished | EntityStatus::Timeout | EntityStatus::Failed
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity
// ─────────────────────────────────────────────────────────────────────────────

/// A group or project being migrated from the source instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub bulk_import_id: String,
    pub parent_id: Option<i64>,
    pub source_type: SourceType,
    pub source_full_path: String,
    pub destination_namespace: String,
    pub destination_name: String,
    /// Local group record the entity was imported into.
    pub group_id: Option<i64>,
    /// Local project record the entity was imported into.
    pub project_id: Option<i64>,
    /// Product version reported by the source instance.
    pub source_version: Option<String>,
    pub status: EntityStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Entity row to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntity {
    pub bulk_import_id: String,
    pub parent_id: Option<i64>,
    pub source_type: SourceType,
    pub source_full_path: String,
    pub destination_namespace: String,
    pub destination_name: String,
    pub source_version: Option<String>,
}

impl NewEntity {
    /// Validates everything that can be checked without the database.
    ///
    /// `parent_type` is the source type of the parent entity, when there is one.
    pub fn validate(&self, parent_type: Option<SourceType>) -> Result<(), ImportError> {
        validate_fields(
            self.source_type,
            &self.source_full_path,
            &self.destination_namespace,
            &self.destination_name,
            None,
            None,
        )?;

        if self.parent_id.is_some() && parent_type != Some(SourceType::GroupEntity) {
            return Err(ImportError::Validation(
                "parent must be a group import".into(),
            ));
        }
        Ok(())
    }
}

impl Entity {
    /// Re-validates a loaded entity, including its local references.
    pub fn validate(&self) -> Result<(), ImportError> {
        validate_fields(
            self.source_type,
            &self.source_full_path,
            &self.destination_namespace,
            &self.destination_name,
            self.group_id,
            self.project_id,
        )
    }

    pub fn is_group(&self) -> bool {
        self.source_type == SourceType::GroupEntity
    }

    pub fn is_project(&self) -> bool {
        self.source_type == SourceType::ProjectEntity
    }

    pub fn entity_type(&self) -> &'static str {
        match self.source_type {
            SourceType::GroupEntity => "group",
            SourceType::ProjectEntity => "project",
        }
    }

    pub fn pluralized_name(&self) -> &'static str {
        match self.source_type {
            SourceType::GroupEntity => "groups",
            SourceType::ProjectEntity => "projects",
        }
    }

    /// `foo/bar` → `foo%2Fbar`
    pub fn encoded_source_full_path(&self) -> String {
        form_urlencoded::byte_serialize(self.source_full_path.as_bytes()).collect()
    }

    pub fn base_resource_url_path(&self) -> String {
        format!("/{}/{}", self.pluralized_name(), self.encoded_source_full_path())
    }

    pub fn export_relations_url_path(&self) -> String {
        format!("{}/export_relations", self.base_resource_url_path())
    }

    pub fn relation_download_url_path(&self, relation: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("relation", relation)
            .finish();
        format!("{}/download?{}", self.export_relations_url_path(), query)
    }

    pub fn wikis_url_path(&self) -> String {
        format!("{}/wikis", self.base_resource_url_path())
    }

    /// Full path the entity will have at the destination.
    pub fn destination_full_path(&self) -> String {
        if self.destination_namespace.is_empty() {
            self.destination_name.clone()
        } else {
            format!("{}/{}", self.destination_namespace, self.destination_name)
        }
    }

    /// Top-level namespace of the destination, if the entity is not itself top-level.
    pub fn root_ancestor(&self) -> Option<&str> {
        self.destination_namespace
            .split('/')
            .next()
            .filter(|segment| !segment.is_empty())
    }
}

fn validate_fields(
    source_type: SourceType,
    source_full_path: &str,
    destination_namespace: &str,
    destination_name: &str,
    group_id: Option<i64>,
    project_id: Option<i64>,
) -> Result<(), ImportError> {
    let mut errors: Vec<String> = Vec::new();

    if source_full_path.trim().is_empty() {
        errors.push("source_full_path can't be blank".into());
    }
    if destination_name.trim().is_empty() {
        errors.push("destination_name can't be blank".into());
    }

    match source_type {
        SourceType::GroupEntity => {
            if project_id.is_some() {
                errors.push("project must not be set for a group import".into());
            }
            if is_same_or_descendant(destination_namespace, source_full_path) {
                errors.push(
                    "Import failed: Destination cannot be a subgroup of the source group. \
                     Change the destination and try again."
                        .into(),
                );
            }
        }
        SourceType::ProjectEntity => {
            if group_id.is_some() {
                errors.push("group must not be set for a project import".into());
            }
            if destination_namespace.trim().is_empty() {
                errors.push("destination_namespace can't be blank for a project import".into());
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ImportError::Validation(errors.join("; ")))
    }
}

fn is_same_or_descendant(path: &str, ancestor: &str) -> bool {
    if path.is_empty() || ancestor.is_empty() {
        return false;
    }
    path == ancestor || path.starts_with(&format!("{}/", ancestor))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entity(source_type: SourceType) -> NewEntity {
        NewEntity {
            bulk_import_id: "import-1".into(),
            parent_id: None,
            source_type,
            source_full_path: "foo/bar".into(),
            destination_namespace: "target".into(),
            destination_name: "bar".into(),
            source_version: Some("15.0.0".into()),
        }
    }

    fn entity(source_type: SourceType) -> Entity {
        let n = new_entity(source_type);
        Entity {
            id: 1,
            bulk_import_id: n.bulk_import_id,
            parent_id: None,
            source_type,
            source_full_path: n.source_full_path,
            destination_namespace: n.destination_namespace,
            destination_name: n.destination_name,
            group_id: None,
            project_id: None,
            source_version: n.source_version,
            status: EntityStatus::Created,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn requires_source_path_and_destination_name() {
        let mut e = new_entity(SourceType::GroupEntity);
        e.source_full_path = String::new();
        e.destination_name = String::new();

        let err = e.validate(None).unwrap_err().to_string();
        assert!(err.contains("source_full_path"));
        assert!(err.contains("destination_name"));
    }

    #[test]
    fn group_entity_may_have_empty_destination_namespace() {
        let mut e = new_entity(SourceType::GroupEntity);
        e.destination_namespace = String::new();
        assert!(e.validate(None).is_ok());
    }

    #[test]
    fn project_entity_requires_destination_namespace() {
        let mut e = new_entity(SourceType::ProjectEntity);
        e.destination_namespace = String::new();
        assert!(e.validate(None).is_err());
    }

    #[test]
    fn group_with_project_reference_is_invalid() {
        let mut e = entity(SourceType::GroupEntity);
        e.project_id = Some(3);
        assert!(e.validate().unwrap_err().to_string().contains("project"));

        let mut e = entity(SourceType::ProjectEntity);
        e.group_id = Some(3);
        assert!(e.validate().unwrap_err().to_string().contains("group"));
    }

    #[test]
    fn parent_must_be_group_import() {
        let mut e = new_entity(SourceType::ProjectEntity);
        e.parent_id = Some(7);

        assert!(e.validate(Some(SourceType::GroupEntity)).is_ok());
        assert!(e.validate(Some(SourceType::ProjectEntity)).is_err());
        assert!(e.validate(None).is_err());
    }

    #[test]
    fn destination_cannot_be_source_or_its_descendant() {
        let mut e = new_entity(SourceType::GroupEntity);
        e.source_full_path = "group_a".into();

        e.destination_namespace = "group_a".into();
        assert!(e.validate(None).unwrap_err().to_string().contains("subgroup of the source"));

        e.destination_namespace = "group_a/group_b".into();
        assert!(e.validate(None).is_err());

        e.destination_namespace = "group_ab".into();
        assert!(e.validate(None).is_ok());
    }

    #[test]
    fn encodes_source_full_path() {
        assert_eq!(entity(SourceType::GroupEntity).encoded_source_full_path(), "foo%2Fbar");
    }

    #[test]
    fn url_paths_follow_entity_type() {
        let group = entity(SourceType::GroupEntity);
        let project = entity(SourceType::ProjectEntity);

        assert_eq!(group.base_resource_url_path(), "/groups/foo%2Fbar");
        assert_eq!(project.export_relations_url_path(), "/projects/foo%2Fbar/export_relations");
        assert_eq!(
            group.relation_download_url_path("test"),
            "/groups/foo%2Fbar/export_relations/download?relation=test"
        );
        assert_eq!(group.wikis_url_path(), "/groups/foo%2Fbar/wikis");
    }

    #[test]
    fn relation_download_path_encodes_relation() {
        let group = entity(SourceType::GroupEntity);
        assert_eq!(
            group.relation_download_url_path("a&b=c d"),
            "/groups/foo%2Fbar/export_relations/download?relation=a%26b%3Dc+d"
        );
    }

    #[test]
    fn source_type_parses_both_spellings() {
        assert_eq!("group".parse::<SourceType>().unwrap(), SourceType::GroupEntity);
        assert_eq!("project_entity".parse::<SourceType>().unwrap(), SourceType::ProjectEntity);
        assert!(matches!(
            "namespace".parse::<SourceType>().unwrap_err(),
            ImportError::Validation(_)
        ));
    }

    #[test]
    fn names_and_predicates() {
        let group = entity(SourceType::GroupEntity);
        let project = entity(SourceType::ProjectEntity);

        assert_eq!(group.entity_type(), "group");
        assert_eq!(project.entity_type(), "project");
        assert_eq!(group.pluralized_name(), "groups");
        assert!(group.is_group() && !group.is_project());
        assert!(project.is_project() && !project.is_group());
    }

    #[test]
    fn root_ancestor_of_destination() {
        let mut e = entity(SourceType::GroupEntity);
        e.destination_namespace = "root/child".into();
        assert_eq!(e.root_ancestor(), Some("root"));
        assert_eq!(e.destination_full_path(), "root/child/bar");

        e.destination_namespace = String::new();
        assert_eq!(e.root_ancestor(), None);
        assert_eq!(e.destination_full_path(), "bar");
    }

    #[test]
    fn human_statuses() {
        assert_eq!(
            EntityStatus::all_human_statuses(),
            ["created", "started", "finished", "failed", "timeout"]
        );
        for status in [
            EntityStatus::Created,
            EntityStatus::Started,
            EntityStatus::Finished,
            EntityStatus::Timeout,
            EntityStatus::Failed,
        ] {
            assert_eq!(EntityStatus::from_code(status.code()), status);
        }
    }
}
