// kiln/src/cli/test.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_core::build::installed_artifact;
use kiln_core::{CheckStatus, VerificationHarness};
use tracing::instrument;

use crate::cli::host_platform;

#[derive(Debug, Args)]
pub struct TestArgs {
    /// Installed formula to check
    name: String,
}

impl TestArgs {
    #[instrument(skip(self, config), fields(formula = %self.name))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let spec = Formulary::new(config).load_formula(&self.name)?;
        let platform = host_platform(config);
        let artifact = installed_artifact(&spec, &platform)?;

        let harness = VerificationHarness::new(config);
        let report = tokio::task::block_in_place(|| harness.verify(&artifact, &spec.test, &platform))?;

        for result in &report.results {
            let label = match &result.status {
                CheckStatus::Passed => "pass".green(),
                CheckStatus::Failed { .. } => "FAIL".red().bold(),
                CheckStatus::Skipped { .. } => "skip".yellow(),
            };
            match &result.status {
                CheckStatus::Passed => println!("{label} {}", result.name),
                CheckStatus::Failed { reason } | CheckStatus::Skipped { reason } => {
                    println!("{label} {}: {}", result.name, reason)
                }
            }
        }
        println!(
            "{}",
            format!(
                "{}: {} passed, {} failed, {} skipped",
                report.formula,
                report.passed(),
                report.failed(),
                report.skipped()
            )
            .bold()
        );
        report.status()
    }
}
