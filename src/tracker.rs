//! Pipeline tracker state machine.
//!
//! A tracker records the progress of one pipeline for one entity. Every status
//! change goes through [`transition`], an explicit (status × event) table, so
//! storage code never writes a status directly.

use serde::{Deserialize, Serialize};

use crate::error::ImportError;

// ─────────────────────────────────────────────────────────────────────────────
// TrackerStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a tracker. Numeric codes are what gets persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Created,
    Enqueued,
    Started,
    Finished,
    Failed,
    Skipped,
    Timeout,
}

impl TrackerStatus {
    pub const ALL: [TrackerStatus; 7] = [
        TrackerStatus::Created,
        TrackerStatus::Enqueued,
        TrackerStatus::Started,
        TrackerStatus::Finished,
        TrackerStatus::Failed,
        TrackerStatus::Skipped,
        TrackerStatus::Timeout,
    ];

    /// Database code for the status.
    pub fn code(&self) -> i64 {
        match self {
            TrackerStatus::Created => 0,
            TrackerStatus::Started => 1,
            TrackerStatus::Finished => 2,
            TrackerStatus::Enqueued => 3,
            TrackerStatus::Timeout => 4,
            TrackerStatus::Failed => -1,
            TrackerStatus::Skipped => -2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerStatus::Created => "created",
            TrackerStatus::Enqueued => "enqueued",
            TrackerStatus::Started => "started",
            TrackerStatus::Finished => "finished",
            TrackerStatus::Failed => "failed",
            TrackerStatus::Skipped => "skipped",
            TrackerStatus::Timeout => "timeout",
        }
    }

    /// Terminal for scheduling purposes: the stage barrier no longer waits on it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackerStatus::Finished
                | TrackerStatus::Failed
                | TrackerStatus::Skipped
                | TrackerStatus::Timeout
        )
    }

    /// Terminal but not successful; surfaces as an incomplete entity.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, TrackerStatus::Failed | TrackerStatus::Timeout)
    }
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TrackerEvent
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Enqueue,
    Start,
    Retry,
    Finish,
    Skip,
    Fail,
    CleanupStale,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Enqueue => "enqueue",
            TrackerEvent::Start => "start",
            TrackerEvent::Retry => "retry",
            TrackerEvent::Finish => "finish",
            TrackerEvent::Skip => "skip",
            TrackerEvent::Fail => "fail_op",
            TrackerEvent::CleanupStale => "cleanup_stale",
        }
    }
}

/// Outcome of looking an event up in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given status (possibly the same one, e.g. `started → started`).
    To(TrackerStatus),
    /// Event accepted without any change.
    Absorbed,
}

/// The transition table.
pub fn transition(status: TrackerStatus, event: TrackerEvent) -> Result<Transition, ImportError> {
    use TrackerEvent as E;
    use TrackerStatus as S;

    let outcome = match (event, status) {
        (E::Enqueue, S::Created) => Transition::To(S::Enqueued),

        (E::Start, S::Enqueued | S::Started) => Transition::To(S::Started),

        (E::Retry, S::Started) => Transition::To(S::Enqueued),

        (E::Finish, S::Started) => Transition::To(S::Finished),
        // A late finish signal must not resurrect a tracker that was resolved elsewhere.
        (E::Finish, S::Failed | S::Skipped | S::Timeout) => Transition::Absorbed,

        (E::Skip, _) => Transition::To(S::Skipped),
        (E::Fail, _) => Transition::To(S::Failed),

        (E::CleanupStale, S::Created | S::Started) => Transition::To(S::Timeout),

        (event, status) => {
            return Err(ImportError::InvalidTransition {
                status: status.as_str(),
                event: event.as_str(),
            })
        }
    };

    Ok(outcome)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted progress of one pipeline for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracker {
    pub id: i64,
    pub entity_id: i64,
    /// Pipeline name.
    pub relation: String,
    pub stage: u32,
    pub status: TrackerStatus,
    /// Pagination cursor to resume extraction from.
    pub next_page: Option<String>,
    pub has_next_page: bool,
    /// Identifier of the worker job that last ran the tracker.
    pub jid: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Tracker row to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTracker {
    pub entity_id: i64,
    pub relation: String,
    pub stage: u32,
}

impl Tracker {
    pub fn pipeline_name(&self) -> &str {
        &self.relation
    }

    /// Checks the invariants every persisted tracker must hold.
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.relation.trim().is_empty() {
            return Err(ImportError::Validation("relation can't be blank".into()));
        }
        if self.has_next_page && self.next_page.is_none() {
            return Err(ImportError::Validation(format!(
                "next_page can't be blank while {} has more pages",
                self.relation
            )));
        }
        Ok(())
    }

    /// Applies an event in memory.
    ///
    /// For `Retry` the cursor becomes the new `next_page`, so a redispatch
    /// resumes forward. `Finish` clears pagination state. Returns whether
    /// anything changed.
    pub fn apply(&mut self, event: TrackerEvent, cursor: Option<String>) -> Result<bool, ImportError> {
        match transition(self.status, event)? {
            Transition::Absorbed => Ok(false),
            Transition::To(next) => {
                match event {
                    TrackerEvent::Retry => {
                        self.has_next_page = cursor.is_some();
                        self.next_page = cursor;
                    }
                    TrackerEvent::Finish => {
                        self.has_next_page = false;
                        self.next_page = None;
                    }
                    _ => {}
                }
                self.status = next;
                self.validate()?;
                Ok(true)
            }
        }
    }
}

impl NewTracker {
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.relation.trim().is_empty() {
            return Err(ImportError::Validation("relation can't be blank".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
