//! Bulk import records: one row per import request.

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::entity::EntityStatus;
use crate::error::ImportError;
use crate::storage::{current_timestamp, Database};

/// Imports share the entity status codes.
pub type ImportStatus = EntityStatus;

/// An import request grouping the entities migrated together.
///
/// The access token used for the source instance is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkImport {
    pub id: String,
    pub source_url: String,
    pub source_version: Option<String>,
    pub status: ImportStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_import(row: &rusqlite::Row<'_>) -> rusqlite::Result<BulkImport> {
    Ok(BulkImport {
        id: row.get(0)?,
        source_url: row.get(1)?,
        source_version: row.get(2)?,
        status: ImportStatus::from_code(row.get(3)?),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Creates a new import in `created` status.
pub async fn create_import(
    db: &Database,
    source_url: &str,
    source_version: Option<&str>,
) -> Result<BulkImport, ImportError> {
    let now = current_timestamp();
    let import = BulkImport {
        id: uuid::Uuid::new_v4().to_string(),
        source_url: source_url.to_string(),
        source_version: source_version.map(str::to_string),
        status: ImportStatus::Created,
        created_at: now,
        updated_at: now,
    };
    let row = import.clone();

    db.blocking("Create import", move |conn| {
        conn.execute(
            r#"
            INSERT INTO bulk_imports (id, source_url, source_version, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                row.id,
                row.source_url,
                row.source_version,
                row.status.code(),
                row.created_at,
                row.updated_at,
            ],
        )
        .map_err(|e| ImportError::Internal(format!("Failed to insert import: {e}")))?;
        Ok(())
    })
    .await?;

    Ok(import)
}

pub async fn get_import(db: &Database, import_id: &str) -> Result<Option<BulkImport>, ImportError> {
    let import_id = import_id.to_string();

    db.blocking("Get import", move |conn| {
        conn.query_row(
            r#"
            SELECT id, source_url, source_version, status, created_at, updated_at
            FROM bulk_imports
            WHERE id = ?1
            "#,
            [&import_id],
            row_to_import,
        )
        .optional()
        .map_err(|e| ImportError::Internal(format!("Failed to query import: {e}")))
    })
    .await
}

/// Lists imports, newest first.
pub async fn list_imports(db: &Database) -> Result<Vec<BulkImport>, ImportError> {
    db.blocking("List imports", move |conn| {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, source_url, source_version, status, created_at, updated_at
                FROM bulk_imports
                ORDER BY created_at DESC, rowid DESC
                "#,
            )
            .map_err(|e| ImportError::Internal(format!("Failed to prepare query: {e}")))?;

        let imports = stmt
            .query_map([], row_to_import)
            .map_err(|e| ImportError::Internal(format!("Failed to query imports: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ImportError::Internal(format!("Failed to collect imports: {e}")))?;

        Ok(imports)
    })
    .await
}

pub async fn update_import_status(
    db: &Database,
    import_id: &str,
    status: ImportStatus,
) -> Result<(), ImportError> {
    let import_id = import_id.to_string();

    db.blocking("Update import status", move |conn| {
        let updated = conn
            .execute(
                "UPDATE bulk_imports SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.code(), current_timestamp(), import_id],
            )
            .map_err(|e| ImportError::Internal(format!("Failed to update import: {e}")))?;

        if updated == 0 {
            return Err(ImportError::NotFound(format!("Bulk import {import_id}")));
        }
        Ok(())
    })
    .await
}
