//! Type definitions shared by the query engine and tooling

pub mod generation;
pub mod report;
