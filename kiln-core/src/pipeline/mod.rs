// kiln-core/src/pipeline/mod.rs
//! Runs a build plan on a worker pool.

pub mod engine;
pub mod scheduler;
pub mod worker;

pub use engine::{run_plan, FormulaJob, RunOptions};
pub use scheduler::{JobBoard, JobState};
pub use worker::InstallJob;
