// kiln-core/src/lib.rs

pub mod build;
pub mod pipeline;
pub mod postinstall;
pub mod resolve;
pub mod synth;
pub mod verify;

// Re-export the entry points the CLI drives
pub use build::{BuildExecutor, CommandRunner, Invocation, ProcessRunner};
pub use pipeline::{run_plan, InstallJob, RunOptions};
pub use postinstall::Configurator;
pub use resolve::{ArchiveResolver, ResolveRequest, SourceTree};
pub use synth::{synthesize, synthesize_resource, ArgumentSet, Placeholders};
pub use verify::{CheckStatus, VerificationHarness, VerificationReport};
