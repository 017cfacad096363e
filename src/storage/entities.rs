//! Entity persistence.

use rusqlite::{Connection, OptionalExtension};

use crate::entity::{Entity, EntityStatus, NewEntity, SourceType};
use crate::error::ImportError;
use crate::storage::{current_timestamp, Database};

const ENTITY_COLUMNS: &str = "id, bulk_import_id, parent_id, source_type, source_full_path, \
     destination_namespace, destination_name, group_id, project_id, source_version, status, \
     created_at, updated_at";

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let source_type: String = row.get(3)?;
    let source_type = source_type.parse::<SourceType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Entity {
        id: row.get(0)?,
        bulk_import_id: row.get(1)?,
        parent_id: row.get(2)?,
        source_type,
        source_full_path: row.get(4)?,
        destination_namespace: row.get(5)?,
        destination_name: row.get(6)?,
        group_id: row.get(7)?,
        project_id: row.get(8)?,
        source_version: row.get(9)?,
        status: EntityStatus::from_code(row.get(10)?),
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn load_entity(conn: &Connection, entity_id: i64) -> Result<Option<Entity>, ImportError> {
    conn.query_row(
        &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
        [entity_id],
        row_to_entity,
    )
    .optional()
    .map_err(|e| ImportError::Internal(format!("Failed to query entity: {e}")))
}

/// Validates and inserts a new entity in `created` status.
pub async fn insert_entity(db: &Database, entity: NewEntity) -> Result<Entity, ImportError> {
    db.blocking("Insert entity", move |conn| {
        let parent_type = match entity.parent_id {
            Some(parent_id) => load_entity(conn, parent_id)?.map(|p| p.source_type),
            None => None,
        };
        entity.validate(parent_type)?;

        let now = current_timestamp();
        conn.execute(
            r#"
            INSERT INTO entities (bulk_import_id, parent_id, source_type, source_full_path,
                destination_namespace, destination_name, source_version, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            rusqlite::params![
                entity.bulk_import_id,
                entity.parent_id,
                entity.source_type.as_str(),
                entity.source_full_path,
                entity.destination_namespace,
                entity.destination_name,
                entity.source_version,
                EntityStatus::Created.code(),
                now,
                now,
            ],
        )
        .map_err(|e| ImportError::Internal(format!("Failed to insert entity: {e}")))?;

        let id = conn.last_insert_rowid();
        load_entity(conn, id)?
            .ok_or_else(|| ImportError::Internal(format!("Entity {id} vanished after insert")))
    })
    .await
}

pub async fn get_entity(db: &Database, entity_id: i64) -> Result<Option<Entity>, ImportError> {
    db.blocking("Get entity", move |conn| load_entity(conn, entity_id))
        .await
}

/// Like [`get_entity`], but a missing row is an error.
pub async fn find_entity(db: &Database, entity_id: i64) -> Result<Entity, ImportError> {
    get_entity(db, entity_id)
        .await?
        .ok_or_else(|| ImportError::NotFound(format!("Entity {entity_id}")))
}

/// Lists the entities of an import in registration order.
pub async fn list_entities(db: &Database, bulk_import_id: &str) -> Result<Vec<Entity>, ImportError> {
    let bulk_import_id = bulk_import_id.to_string();

    db.blocking("List entities", move |conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE bulk_import_id = ?1 ORDER BY id ASC"
            ))
            .map_err(|e| ImportError::Internal(format!("Failed to prepare query: {e}")))?;

        let entities = stmt
            .query_map([&bulk_import_id], row_to_entity)
            .map_err(|e| ImportError::Internal(format!("Failed to query entities: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ImportError::Internal(format!("Failed to collect entities: {e}")))?;

        Ok(entities)
    })
    .await
}

/// Child of `parent_id` imported from `source_full_path`, if registered already.
pub async fn find_child_entity(
    db: &Database,
    parent_id: i64,
    source_full_path: &str,
) -> Result<Option<Entity>, ImportError> {
    let source_full_path = source_full_path.to_string();

    db.blocking("Find child entity", move |conn| {
        conn.query_row(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE parent_id = ?1 AND source_full_path = ?2"
            ),
            rusqlite::params![parent_id, source_full_path],
            row_to_entity,
        )
        .optional()
        .map_err(|e| ImportError::Internal(format!("Failed to query entity: {e}")))
    })
    .await
}

/// Entities of an import that have not reached a terminal status.
pub async fn list_active_entities(
    db: &Database,
    bulk_import_id: &str,
) -> Result<Vec<Entity>, ImportError> {
    Ok(list_entities(db, bulk_import_id)
        .await?
        .into_iter()
        .filter(|e| !e.status.is_terminal())
        .collect())
}

pub async fn update_entity_status(
    db: &Database,
    entity_id: i64,
    status: EntityStatus,
) -> Result<(), ImportError> {
    db.blocking("Update entity status", move |conn| {
        let updated = conn
            .execute(
                "UPDATE entities SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.code(), current_timestamp(), entity_id],
            )
            .map_err(|e| ImportError::Internal(format!("Failed to update entity: {e}")))?;

        if updated == 0 {
            return Err(ImportError::NotFound(format!("Entity {entity_id}")));
        }
        Ok(())
    })
    .await
}

/// Local record the entity was imported into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReference {
    Group(i64),
    Project(i64),
}

/// Links an entity to the local record it was imported into.
///
/// The reference kind must match the entity type.
pub async fn set_local_reference(
    db: &Database,
    entity_id: i64,
    reference: LocalReference,
) -> Result<Entity, ImportError> {
    db.blocking("Set entity reference", move |conn| {
        let mut entity = load_entity(conn, entity_id)?
            .ok_or_else(|| ImportError::NotFound(format!("Entity {entity_id}")))?;

        match reference {
            LocalReference::Group(id) => entity.group_id = Some(id),
            LocalReference::Project(id) => entity.project_id = Some(id),
        }
        entity.validate()?;

        conn.execute(
            "UPDATE entities SET group_id = ?1, project_id = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![entity.group_id, entity.project_id, current_timestamp(), entity_id],
        )
        .map_err(|e| ImportError::Internal(format!("Failed to update entity: {e}")))?;

        Ok(entity)
    })
    .await
}
