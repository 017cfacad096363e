//! Project imports: stage contributor, project pipelines and wikis.

pub mod pipelines;
pub mod stage;
pub mod wiki;
