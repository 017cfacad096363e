//! Storage module for the local SQLite database.

mod database;
pub mod entities;
pub mod failures;
pub mod imports;
pub mod records;
pub mod trackers;

pub(crate) use database::current_timestamp;
pub use database::Database;
