//! Destination store for loaded records.
//!
//! Records are keyed by (entity, relation, source key), so re-delivering an
//! item after a page retry overwrites instead of duplicating.

use rusqlite::OptionalExtension;
use serde_json::Value;

use crate::error::ImportError;
use crate::storage::{current_timestamp, Database};

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedRecord {
    pub id: i64,
    pub entity_id: i64,
    pub relation: String,
    pub source_key: String,
    pub payload: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportedRecord> {
    let payload: String = row.get(4)?;
    let payload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ImportedRecord {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        relation: row.get(2)?,
        source_key: row.get(3)?,
        payload,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Inserts or replaces a record. Returns the row id, stable across upserts.
pub async fn upsert_record(
    db: &Database,
    entity_id: i64,
    relation: &str,
    source_key: &str,
    payload: &Value,
) -> Result<i64, ImportError> {
    let relation = relation.to_string();
    let source_key = source_key.to_string();
    let payload = serde_json::to_string(payload)
        .map_err(|e| ImportError::Internal(format!("Failed to serialize record: {e}")))?;

    db.blocking("Upsert record", move |conn| {
        let now = current_timestamp();
        conn.query_row(
            r#"
            INSERT INTO imported_records (entity_id, relation, source_key, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(entity_id, relation, source_key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
            rusqlite::params![entity_id, relation, source_key, payload, now, now],
            |row| row.get(0),
        )
        .map_err(|e| ImportError::Internal(format!("Failed to upsert record: {e}")))
    })
    .await
}

pub async fn get_record(
    db: &Database,
    entity_id: i64,
    relation: &str,
    source_key: &str,
) -> Result<Option<ImportedRecord>, ImportError> {
    let relation = relation.to_string();
    let source_key = source_key.to_string();

    db.blocking("Get record", move |conn| {
        conn.query_row(
            r#"
            SELECT id, entity_id, relation, source_key, payload, created_at, updated_at
            FROM imported_records
            WHERE entity_id = ?1 AND relation = ?2 AND source_key = ?3
            "#,
            rusqlite::params![entity_id, relation, source_key],
            row_to_record,
        )
        .optional()
        .map_err(|e| ImportError::Internal(format!("Failed to query record: {e}")))
    })
    .await
}

/// Records of one relation for an entity, in insertion order.
pub async fn list_records(
    db: &Database,
    entity_id: i64,
    relation: &str,
) -> Result<Vec<ImportedRecord>, ImportError> {
    let relation = relation.to_string();

    db.blocking("List records", move |conn| {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, entity_id, relation, source_key, payload, created_at, updated_at
                FROM imported_records
                WHERE entity_id = ?1 AND relation = ?2
                ORDER BY id ASC
                "#,
            )
            .map_err(|e| ImportError::Internal(format!("Failed to prepare query: {e}")))?;

        let records = stmt
            .query_map(rusqlite::params![entity_id, relation], row_to_record)
            .map_err(|e| ImportError::Internal(format!("Failed to query records: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ImportError::Internal(format!("Failed to collect records: {e}")))?;

        Ok(records)
    })
    .await
}
