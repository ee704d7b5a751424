//! Top-level setup layer: per-repository dispatch to the root maps and
//! the statistics the driver reports.

pub mod parse;
pub mod repos_to_setup;
pub mod stats;
