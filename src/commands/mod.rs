//! Command handlers behind the CLI.

pub mod import;
pub mod status;

pub use import::*;
pub use status::*;
