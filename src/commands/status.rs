//! Import status reports.

use std::fmt::Write as _;

use serde::Serialize;

use crate::entity::{Entity, EntityStatus, SourceType};
use crate::error::ImportError;
use crate::storage::failures::{self, Failure};
use crate::storage::imports::{self, BulkImport, ImportStatus};
use crate::storage::{entities, trackers, Database};
use crate::tracker::{Tracker, TrackerStatus};

#[derive(Debug, Clone, Serialize)]
pub struct TrackerReport {
    pub relation: String,
    pub stage: u32,
    pub status: TrackerStatus,
    pub next_page: Option<String>,
}

impl From<Tracker> for TrackerReport {
    fn from(tracker: Tracker) -> Self {
        Self {
            relation: tracker.relation,
            stage: tracker.stage,
            status: tracker.status,
            next_page: tracker.next_page,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub id: i64,
    pub source_type: SourceType,
    pub source_full_path: String,
    pub destination_full_path: String,
    pub status: EntityStatus,
    /// Some pipeline failed or timed out.
    pub incomplete: bool,
    pub trackers: Vec<TrackerReport>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub id: String,
    pub source_url: String,
    pub source_version: Option<String>,
    pub status: ImportStatus,
    /// Some entity failed or is incomplete.
    pub incomplete: bool,
    pub entities: Vec<EntityReport>,
}

async fn entity_report(db: &Database, entity: Entity) -> Result<EntityReport, ImportError> {
    let tracked = trackers::list_trackers(db, entity.id).await?;
    let failures = failures::list_failures(db, entity.id).await?;

    Ok(EntityReport {
        id: entity.id,
        source_type: entity.source_type,
        destination_full_path: entity.destination_full_path(),
        incomplete: tracked.iter().any(|t| t.status.is_unsuccessful()),
        status: entity.status,
        source_full_path: entity.source_full_path,
        trackers: tracked.into_iter().map(TrackerReport::from).collect(),
        failures,
    })
}

/// Builds the report of one import.
pub async fn import_status(db: &Database, import_id: &str) -> Result<ImportReport, ImportError> {
    let import = imports::get_import(db, import_id)
        .await?
        .ok_or_else(|| ImportError::NotFound(format!("Bulk import {import_id}")))?;

    let mut reports = Vec::new();
    for entity in entities::list_entities(db, import_id).await? {
        reports.push(entity_report(db, entity).await?);
    }

    let incomplete = reports
        .iter()
        .any(|e| e.incomplete || e.status == EntityStatus::Failed);

    Ok(ImportReport {
        id: import.id,
        source_url: import.source_url,
        source_version: import.source_version,
        status: import.status,
        incomplete,
        entities: reports,
    })
}

/// Every import, newest first.
pub async fn list_import_status(db: &Database) -> Result<Vec<BulkImport>, ImportError> {
    imports::list_imports(db).await
}

/// Human-readable rendering of a report.
pub fn render_report(report: &ImportReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Import {} from {} ({}): {}{}",
        report.id,
        report.source_url,
        report.source_version.as_deref().unwrap_or("unknown version"),
        report.status.as_str(),
        if report.incomplete { " (incomplete)" } else { "" }
    );

    for entity in &report.entities {
        let _ = writeln!(
            out,
            "  {} {} -> {}: {}{}",
            entity.source_type.as_str(),
            entity.source_full_path,
            entity.destination_full_path,
            entity.status.as_str(),
            if entity.incomplete { " (incomplete)" } else { "" }
        );
        for tracker in &entity.trackers {
            let _ = writeln!(
                out,
                "    [{}] {:<20} {}",
                tracker.stage,
                tracker.relation,
                tracker.status
            );
        }
        for failure in &entity.failures {
            let _ = writeln!(
                out,
                "    ! {} {}: {} ({})",
                failure.pipeline_class,
                failure.pipeline_step,
                failure.exception_message,
                failure.correlation_id
            );
        }
    }
    out
}

/// One line per import.
pub fn render_import_list(list: &[BulkImport]) -> String {
    let mut out = String::new();
    for import in list {
        let _ = writeln!(
            out,
            "{}  {:<8}  {}",
            import.id,
            import.status.as_str(),
            import.source_url
        );
    }
    out
}
