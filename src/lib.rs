//! Staged, resumable migration of groups and projects from a remote source
//! instance.
//!
//! Every entity of an import gets one tracker per pipeline, grouped into
//! ordered stages. The orchestrator dispatches a stage only once the previous
//! one is terminal, and workers run each tracker's pipeline a page at a time.

pub mod capabilities;
pub mod commands;
pub mod config;
pub mod entity;
pub mod error;
pub mod groups;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod projects;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod source;
pub mod stage;
pub mod state;
pub mod storage;
pub mod tracker;
pub mod validation;
pub mod worker;

#[cfg(test)]
mod test_support;
