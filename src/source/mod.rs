//! Remote source instance API.

pub mod client;

pub use client::{sanitize_url_for_logs, LoggingMode, Page, SourceClient};
