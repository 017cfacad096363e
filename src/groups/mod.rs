//! Group imports: stage contributors and group-only pipelines.

pub mod pipelines;
pub mod stage;
