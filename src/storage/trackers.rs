//! Tracker persistence.
//!
//! Status changes go through [`apply_event`], which reads the row, runs the
//! transition table and writes the result inside one IMMEDIATE transaction.
//! Concurrent workers racing on the same tracker therefore serialize on the
//! database write lock, and the loser sees the winner's status.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::error::ImportError;
use crate::storage::{current_timestamp, Database};
use crate::tracker::{NewTracker, Tracker, TrackerEvent, TrackerStatus};

const TRACKER_COLUMNS: &str =
    "id, entity_id, relation, stage, status, next_page, has_next_page, jid, created_at, updated_at";

fn row_to_tracker(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tracker> {
    let stage: i64 = row.get(3)?;
    let status: i64 = row.get(4)?;

    Ok(Tracker {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        relation: row.get(2)?,
        stage: u32::try_from(stage).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, stage))?,
        status: TrackerStatus::from_code(status)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, status))?,
        next_page: row.get(5)?,
        has_next_page: row.get(6)?,
        jid: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn load_tracker(conn: &Connection, tracker_id: i64) -> Result<Option<Tracker>, ImportError> {
    conn.query_row(
        &format!("SELECT {TRACKER_COLUMNS} FROM trackers WHERE id = ?1"),
        [tracker_id],
        row_to_tracker,
    )
    .optional()
    .map_err(|e| ImportError::Internal(format!("Failed to query tracker: {e}")))
}

fn query_trackers(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Tracker>, ImportError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TRACKER_COLUMNS} FROM trackers WHERE {filter} ORDER BY stage ASC, id ASC"
        ))
        .map_err(|e| ImportError::Internal(format!("Failed to prepare query: {e}")))?;

    let trackers = stmt
        .query_map(params, row_to_tracker)
        .map_err(|e| ImportError::Internal(format!("Failed to query trackers: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ImportError::Internal(format!("Failed to collect trackers: {e}")))?;

    Ok(trackers)
}

// ─────────────────────────────────────────────────────────────────────────────
// Creation & lookup
// ─────────────────────────────────────────────────────────────────────────────

/// Creates trackers for an entity in one transaction.
///
/// A relation already tracked for the entity (or repeated in `trackers`)
/// rejects the whole batch and nothing is persisted.
pub async fn create_trackers(
    db: &Database,
    entity_id: i64,
    trackers: Vec<NewTracker>,
) -> Result<Vec<Tracker>, ImportError> {
    db.blocking("Create trackers", move |conn| {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ImportError::Internal(format!("Failed to start transaction: {e}")))?;

        let now = current_timestamp();
        let mut ids = Vec::with_capacity(trackers.len());

        for tracker in &trackers {
            tracker.validate()?;
            if tracker.entity_id != entity_id {
                return Err(ImportError::Validation(format!(
                    "tracker for {} belongs to entity {}, not {entity_id}",
                    tracker.relation, tracker.entity_id
                )));
            }

            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM trackers WHERE entity_id = ?1 AND relation = ?2)",
                    rusqlite::params![entity_id, tracker.relation],
                    |row| row.get(0),
                )
                .map_err(|e| ImportError::Internal(format!("Failed to query tracker: {e}")))?;
            if exists {
                return Err(ImportError::Validation(format!(
                    "relation {} has already been taken for entity {entity_id}",
                    tracker.relation
                )));
            }

            tx.execute(
                r#"
                INSERT INTO trackers (entity_id, relation, stage, status, has_next_page, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)
                "#,
                rusqlite::params![
                    entity_id,
                    tracker.relation,
                    tracker.stage,
                    TrackerStatus::Created.code(),
                    now,
                    now,
                ],
            )
            .map_err(|e| ImportError::Internal(format!("Failed to insert tracker: {e}")))?;
            ids.push(tx.last_insert_rowid());
        }

        let mut created = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tracker) = load_tracker(&tx, id)? {
                created.push(tracker);
            }
        }

        tx.commit()
            .map_err(|e| ImportError::Internal(format!("Failed to commit transaction: {e}")))?;

        Ok(created)
    })
    .await
}

pub async fn get_tracker(db: &Database, tracker_id: i64) -> Result<Option<Tracker>, ImportError> {
    db.blocking("Get tracker", move |conn| load_tracker(conn, tracker_id))
        .await
}

/// All trackers of an entity, ordered by stage.
pub async fn list_trackers(db: &Database, entity_id: i64) -> Result<Vec<Tracker>, ImportError> {
    db.blocking("List trackers", move |conn| {
        query_trackers(conn, "entity_id = ?1", [entity_id])
    })
    .await
}

/// Trackers of an entity at one stage.
pub async fn list_stage_trackers(
    db: &Database,
    entity_id: i64,
    stage: u32,
) -> Result<Vec<Tracker>, ImportError> {
    db.blocking("List stage trackers", move |conn| {
        query_trackers(conn, "entity_id = ?1 AND stage = ?2", rusqlite::params![entity_id, stage])
    })
    .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Transitions
// ─────────────────────────────────────────────────────────────────────────────

/// Applies a state-machine event to a tracker.
///
/// `cursor` is only used by [`TrackerEvent::Retry`]: it becomes the tracker's
/// `next_page`. Returns the tracker as persisted after the event.
pub async fn apply_event(
    db: &Database,
    tracker_id: i64,
    event: TrackerEvent,
    cursor: Option<String>,
) -> Result<Tracker, ImportError> {
    db.blocking("Apply tracker event", move |conn| {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| ImportError::Internal(format!("Failed to start transaction: {e}")))?;

        let mut tracker = load_tracker(&tx, tracker_id)?
            .ok_or_else(|| ImportError::NotFound(format!("Tracker {tracker_id}")))?;

        if tracker.apply(event, cursor)? {
            tracker.updated_at = current_timestamp();
            tx.execute(
                r#"
                UPDATE trackers
                SET status = ?1, next_page = ?2, has_next_page = ?3, updated_at = ?4
                WHERE id = ?5
                "#,
                rusqlite::params![
                    tracker.status.code(),
                    tracker.next_page,
                    tracker.has_next_page,
                    tracker.updated_at,
                    tracker_id,
                ],
            )
            .map_err(|e| ImportError::Internal(format!("Failed to update tracker: {e}")))?;
        }

        tx.commit()
            .map_err(|e| ImportError::Internal(format!("Failed to commit transaction: {e}")))?;

        Ok(tracker)
    })
    .await
}

/// Compare-and-swap `created → enqueued`.
///
/// Returns `None` when another dispatcher already moved the tracker on.
pub async fn try_enqueue(db: &Database, tracker_id: i64) -> Result<Option<Tracker>, ImportError> {
    match apply_event(db, tracker_id, TrackerEvent::Enqueue, None).await {
        Ok(tracker) => Ok(Some(tracker)),
        Err(ImportError::InvalidTransition { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Records the job that is running the tracker.
pub async fn set_jid(db: &Database, tracker_id: i64, jid: &str) -> Result<(), ImportError> {
    let jid = jid.to_string();

    db.blocking("Set tracker jid", move |conn| {
        conn.execute(
            "UPDATE trackers SET jid = ?1 WHERE id = ?2",
            rusqlite::params![jid, tracker_id],
        )
        .map_err(|e| ImportError::Internal(format!("Failed to update tracker: {e}")))?;
        Ok(())
    })
    .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage queries
// ─────────────────────────────────────────────────────────────────────────────

/// Lowest stage that still has a `created` tracker.
pub async fn next_created_stage(db: &Database, entity_id: i64) -> Result<Option<u32>, ImportError> {
    db.blocking("Next created stage", move |conn| {
        let stage: Option<i64> = conn
            .query_row(
                "SELECT MIN(stage) FROM trackers WHERE entity_id = ?1 AND status = ?2",
                rusqlite::params![entity_id, TrackerStatus::Created.code()],
                |row| row.get(0),
            )
            .map_err(|e| ImportError::Internal(format!("Failed to query stage: {e}")))?;

        stage
            .map(|s| u32::try_from(s).map_err(|_| ImportError::Internal(format!("Negative stage {s}"))))
            .transpose()
    })
    .await
}

/// True iff some tracker at `stage` is `created`, `enqueued` or `started`.
pub async fn stage_running(db: &Database, entity_id: i64, stage: u32) -> Result<bool, ImportError> {
    db.blocking("Stage running", move |conn| {
        conn.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM trackers
                WHERE entity_id = ?1 AND stage = ?2 AND status IN (?3, ?4, ?5)
            )
            "#,
            rusqlite::params![
                entity_id,
                stage,
                TrackerStatus::Created.code(),
                TrackerStatus::Enqueued.code(),
                TrackerStatus::Started.code(),
            ],
            |row| row.get(0),
        )
        .map_err(|e| ImportError::Internal(format!("Failed to query stage: {e}")))
    })
    .await
}

/// True iff some tracker below `stage` has not reached a terminal status.
pub async fn earlier_stage_running(
    db: &Database,
    entity_id: i64,
    stage: u32,
) -> Result<bool, ImportError> {
    db.blocking("Earlier stage running", move |conn| {
        conn.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM trackers
                WHERE entity_id = ?1 AND stage < ?2 AND status IN (?3, ?4, ?5)
            )
            "#,
            rusqlite::params![
                entity_id,
                stage,
                TrackerStatus::Created.code(),
                TrackerStatus::Enqueued.code(),
                TrackerStatus::Started.code(),
            ],
            |row| row.get(0),
        )
        .map_err(|e| ImportError::Internal(format!("Failed to query stage: {e}")))
    })
    .await
}

/// `created`/`started` trackers of an entity last touched at or before `cutoff`.
pub async fn list_stale_trackers(
    db: &Database,
    entity_id: i64,
    cutoff: i64,
) -> Result<Vec<Tracker>, ImportError> {
    db.blocking("List stale trackers", move |conn| {
        query_trackers(
            conn,
            "entity_id = ?1 AND status IN (?2, ?3) AND updated_at <= ?4",
            rusqlite::params![
                entity_id,
                TrackerStatus::Created.code(),
                TrackerStatus::Started.code(),
                cutoff,
            ],
        )
    })
    .await
}
