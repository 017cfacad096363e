//! Failure records for pipeline errors.

use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::storage::{current_timestamp, Database};

/// Pipeline step a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Extractor,
    Transformer,
    Loader,
    PipelineWorkerRun,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Extractor => "extractor",
            PipelineStep::Transformer => "transformer",
            PipelineStep::Loader => "loader",
            PipelineStep::PipelineWorkerRun => "pipeline_worker_run",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub id: i64,
    pub entity_id: i64,
    pub pipeline_class: String,
    pub pipeline_step: String,
    pub exception_class: String,
    pub exception_message: String,
    pub correlation_id: String,
    pub created_at: i64,
}

/// Records `error` against an entity.
///
/// The message is sanitized before it is stored.
pub async fn record_failure(
    db: &Database,
    entity_id: i64,
    pipeline_class: &str,
    step: PipelineStep,
    error: &ImportError,
    correlation_id: &str,
) -> Result<(), ImportError> {
    let pipeline_class = pipeline_class.to_string();
    let exception_class = error.kind().to_string();
    let exception_message = error.sanitized_message();
    let correlation_id = correlation_id.to_string();

    db.blocking("Record failure", move |conn| {
        conn.execute(
            r#"
            INSERT INTO failures (entity_id, pipeline_class, pipeline_step, exception_class,
                exception_message, correlation_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            rusqlite::params![
                entity_id,
                pipeline_class,
                step.as_str(),
                exception_class,
                exception_message,
                correlation_id,
                current_timestamp(),
            ],
        )
        .map_err(|e| ImportError::Internal(format!("Failed to insert failure: {e}")))?;
        Ok(())
    })
    .await
}

/// Failures of an entity, oldest first.
pub async fn list_failures(db: &Database, entity_id: i64) -> Result<Vec<Failure>, ImportError> {
    db.blocking("List failures", move |conn| {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, entity_id, pipeline_class, pipeline_step, exception_class,
                       exception_message, correlation_id, created_at
                FROM failures
                WHERE entity_id = ?1
                ORDER BY id ASC
                "#,
            )
            .map_err(|e| ImportError::Internal(format!("Failed to prepare query: {e}")))?;

        let failures = stmt
            .query_map([entity_id], |row| {
                Ok(Failure {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    pipeline_class: row.get(2)?,
                    pipeline_step: row.get(3)?,
                    exception_class: row.get(4)?,
                    exception_message: row.get(5)?,
                    correlation_id: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .map_err(|e| ImportError::Internal(format!("Failed to query failures: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ImportError::Internal(format!("Failed to collect failures: {e}")))?;

        Ok(failures)
    })
    .await
}
