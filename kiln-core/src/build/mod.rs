// kiln-core/src/build/mod.rs
//! Running a formula's build: environment, toolchain discovery, the stage state machine and the
//! install receipt.

pub mod devtools;
pub mod env;
pub mod executor;
pub mod receipt;
pub mod runner;

pub use devtools::detect_platform;
pub use env::BuildEnvironment;
pub use executor::BuildExecutor;
pub use receipt::{installed_artifact, InstallReceipt};
pub use runner::{CommandOutcome, CommandRunner, Invocation, ProcessRunner};
