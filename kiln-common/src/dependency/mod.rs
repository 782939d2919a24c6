// kiln-common/src/dependency/mod.rs
pub mod definition;
pub mod graph;

pub use definition::{Dependency, DependencyTag};
pub use graph::{BuildPlan, FormulaGraph, PlanEntry, PlanOptions};
