use std::time::Duration;

use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe to persist or display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "private-token",
    "access_token",
    "oauth2:",
    "authorization:",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Replaces the message with the fallback if it carries sensitive content.
pub(crate) fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum ImportError {
    // ── Source API ────────────────────────────────────────────────────────────
    #[error("Source instance rejected the access token")]
    NotAuthenticated,

    #[error("Source error: {0}")]
    SourceError(String),

    #[error("Rate limited by source instance")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Source instance unavailable (HTTP {0})")]
    SourceUnavailable(u16),

    #[error("Not found: {0}")]
    NotFound(String),

    // ── Pipelines / Trackers ──────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cannot {event} a tracker in status {status}")]
    InvalidTransition {
        status: &'static str,
        event: &'static str,
    },

    #[error("{message}")]
    Retry {
        message: String,
        retry_delay_secs: u64,
    },

    // ── Load side ─────────────────────────────────────────────────────────────
    #[error("URL blocked: {0}")]
    UrlBlocked(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Operation cancelled")]
    Cancelled,

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImportError {
    /// Errors worth re-dispatching the same page for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImportError::ConnectionFailed(_)
                | ImportError::SourceUnavailable(_)
                | ImportError::RateLimited { .. }
                | ImportError::Retry { .. }
        )
    }

    /// Errors that make any further item in the batch pointless.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            ImportError::NotAuthenticated
                | ImportError::Configuration(_)
                | ImportError::UrlBlocked(_)
                | ImportError::Cancelled
        )
    }

    /// Delay requested by the error itself, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ImportError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            ImportError::Retry {
                retry_delay_secs, ..
            } => Some(Duration::from_secs(*retry_delay_secs)),
            _ => None,
        }
    }

    /// Stable variant name, recorded as the exception class of a failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::NotAuthenticated => "NotAuthenticated",
            ImportError::SourceError(_) => "SourceError",
            ImportError::RateLimited { .. } => "RateLimited",
            ImportError::ConnectionFailed(_) => "ConnectionFailed",
            ImportError::SourceUnavailable(_) => "SourceUnavailable",
            ImportError::NotFound(_) => "NotFound",
            ImportError::Configuration(_) => "Configuration",
            ImportError::Validation(_) => "Validation",
            ImportError::InvalidTransition { .. } => "InvalidTransition",
            ImportError::Retry { .. } => "Retry",
            ImportError::UrlBlocked(_) => "UrlBlocked",
            ImportError::Repository(_) => "Repository",
            ImportError::Cancelled => "Cancelled",
            ImportError::Internal(_) => "Internal",
        }
    }

    /// Message safe to persist in failure records and print in status reports.
    /// Never leaks tokens or credentials embedded in URLs.
    pub fn sanitized_message(&self) -> String {
        match self {
            ImportError::Repository(msg) => {
                sanitize_message(msg, "Repository operation failed")
            }
            ImportError::SourceError(msg) => sanitize_message(msg, "Source request failed"),
            ImportError::ConnectionFailed(_) => "Connection to source instance failed".into(),
            ImportError::Internal(_) => "Internal error".into(),
            other => sanitize_message(&other.to_string(), "Pipeline error"),
        }
    }
}
