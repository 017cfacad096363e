//! SQLite database module with schema migrations.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::ImportError;

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i32 = 2;

/// V1 schema: imports, entities and their trackers.
const V1_SCHEMA: &str = r#"
-- Import requests
CREATE TABLE IF NOT EXISTS bulk_imports (
    id TEXT PRIMARY KEY NOT NULL,
    source_url TEXT NOT NULL,
    source_version TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Groups and projects being imported
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bulk_import_id TEXT NOT NULL REFERENCES bulk_imports(id) ON DELETE CASCADE,
    parent_id INTEGER REFERENCES entities(id) ON DELETE CASCADE,
    source_type TEXT NOT NULL,
    source_full_path TEXT NOT NULL,
    destination_namespace TEXT NOT NULL DEFAULT '',
    destination_name TEXT NOT NULL,
    group_id INTEGER,
    project_id INTEGER,
    source_version TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_bulk_import_id ON entities(bulk_import_id);
CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(status);

-- One tracker per (entity, pipeline)
CREATE TABLE IF NOT EXISTS trackers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relation TEXT NOT NULL,
    stage INTEGER NOT NULL CHECK (stage >= 0),
    status INTEGER NOT NULL DEFAULT 0,
    next_page TEXT,
    has_next_page INTEGER NOT NULL DEFAULT 0,
    jid TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (entity_id, relation)
);

CREATE INDEX IF NOT EXISTS idx_trackers_entity_stage ON trackers(entity_id, stage);
CREATE INDEX IF NOT EXISTS idx_trackers_status ON trackers(status);

-- Pipeline failures
CREATE TABLE IF NOT EXISTS failures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    pipeline_class TEXT NOT NULL,
    pipeline_step TEXT NOT NULL,
    exception_class TEXT NOT NULL,
    exception_message TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_failures_entity_id ON failures(entity_id);
"#;

/// V2 migration: destination store for loaded records.
const V2_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS imported_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relation TEXT NOT NULL,
    source_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (entity_id, relation, source_key)
);

CREATE INDEX IF NOT EXISTS idx_imported_records_entity ON imported_records(entity_id, relation);
"#;

/// SQLite database handle.
#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Initializes the database at the given path.
    /// Creates parent directories if needed, opens the SQLite file, and runs migrations.
    pub async fn init(db_path: PathBuf) -> Result<Self, ImportError> {
        let path = db_path.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ImportError::Internal(format!("Failed to create database directory: {e}"))
                })?;
            }

            let mut conn = Connection::open(&path)
                .map_err(|e| ImportError::Internal(format!("Failed to open database: {e}")))?;

            configure_connection(&conn)?;
            run_migrations(&mut conn)?;

            Ok::<_, ImportError>(())
        })
        .await
        .map_err(|e| ImportError::Internal(format!("Database init task failed: {e}")))??;

        Ok(Self { db_path })
    }

    /// Returns the database path for use by other storage modules.
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Simple health check: executes SELECT 1.
    pub async fn health_check(&self) -> Result<(), ImportError> {
        self.blocking("Health check", |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| ImportError::Internal(format!("Health check failed: {e}")))
        })
        .await
    }

    /// Runs `f` on a freshly opened connection inside `spawn_blocking`.
    ///
    /// `task` names the operation in the join error message.
    pub(crate) async fn blocking<T, F>(&self, task: &'static str, f: F) -> Result<T, ImportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, ImportError> + Send + 'static,
    {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ImportError::Internal(format!("{task} task failed: {e}")))?
    }
}

/// Opens and configures a connection.
pub(crate) fn open_connection(db_path: &PathBuf) -> Result<Connection, ImportError> {
    let conn = Connection::open(db_path)
        .map_err(|e| ImportError::Internal(format!("Failed to open database: {e}")))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Configures connection with busy timeout, WAL mode and foreign keys.
fn configure_connection(conn: &Connection) -> Result<(), ImportError> {
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| ImportError::Internal(format!("Failed to set busy timeout: {e}")))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| ImportError::Internal(format!("Failed to set WAL mode: {e}")))?;

    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| ImportError::Internal(format!("Failed to enable foreign keys: {e}")))?;

    Ok(())
}

/// Returns current unix timestamp in seconds.
pub(crate) fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Runs database migrations using PRAGMA user_version.
fn run_migrations(conn: &mut Connection) -> Result<(), ImportError> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| ImportError::Internal(format!("Failed to get schema version: {e}")))?;

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().map_err(|e| {
        ImportError::Internal(format!("Failed to start migration transaction: {e}"))
    })?;

    if current_version < 1 {
        tx.execute_batch(V1_SCHEMA)
            .map_err(|e| ImportError::Internal(format!("V1 migration failed: {e}")))?;
    }

    if current_version < 2 {
        tx.execute_batch(V2_MIGRATION)
            .map_err(|e| ImportError::Internal(format!("V2 migration failed: {e}")))?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| ImportError::Internal(format!("Failed to update schema version: {e}")))?;

    tx.commit()
        .map_err(|e| ImportError::Internal(format!("Failed to commit migration: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db_path() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        (temp_dir, db_path)
    }

    #[tokio::test]
    async fn test_init_creates_schema() {
        let (_dir, db_path) = test_db_path();
        let db = Database::init(db_path.clone()).await.unwrap();
        db.health_check().await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        for table in ["bulk_imports", "entities", "trackers", "failures", "imported_records"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (_dir, db_path) = test_db_path();
        Database::init(db_path.clone()).await.unwrap();
        let db = Database::init(db_path).await.unwrap();
        db.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("imports.db");

        Database::init(db_path.clone()).await.unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_current_timestamp_is_positive() {
        assert!(current_timestamp() > 1_600_000_000);
    }
}
