// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::model::platform::PlatformProfile;
use kiln_core::build::detect_platform;
use tracing::debug;

pub mod info;
pub mod install;
pub mod plan;
pub mod postinstall;
pub mod status;
pub mod test;

use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::plan::PlanArgs;
use crate::cli::postinstall::PostinstallArgs;
use crate::cli::test::TestArgs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build and install formulas together with their dependencies
    Install(InstallArgs),
    /// Run the smoke checks of an installed formula
    Test(TestArgs),
    /// Print the order formulas would be built in
    Plan(PlanArgs),
    /// Regenerate the configuration files of an installed formula
    Postinstall(PostinstallArgs),
    /// Show what a formula description declares
    Info(Info),
}

impl Command {
    pub async fn run(&self, config: &Config) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config).await,
            Self::Test(command) => command.run(config).await,
            Self::Plan(command) => command.run(config).await,
            Self::Postinstall(command) => command.run(config).await,
            Self::Info(command) => command.run(config).await,
        }
    }
}

/// The host, detected once per invocation.
pub(crate) fn host_platform(config: &Config) -> Arc<PlatformProfile> {
    let platform = detect_platform(config.kiln_root());
    debug!(
        "Host platform: {} {} (capabilities: {:?})",
        platform.os, platform.arch, platform.capabilities
    );
    Arc::new(platform)
}
