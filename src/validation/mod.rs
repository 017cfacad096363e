//! Validation of untrusted input from the source instance.

pub mod url_blocker;

pub use url_blocker::UrlBlocker;
