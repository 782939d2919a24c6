// kiln/src/cli/postinstall.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::model::artifact::ConfigOutcome;
use kiln_core::build::installed_artifact;
use kiln_core::Configurator;
use tracing::instrument;

use crate::cli::host_platform;

#[derive(Debug, Args)]
pub struct PostinstallArgs {
    /// Installed formula whose configuration files are regenerated
    name: String,
}

impl PostinstallArgs {
    #[instrument(skip(self, config), fields(formula = %self.name))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let spec = Formulary::new(config).load_formula(&self.name)?;
        let platform = host_platform(config);
        let artifact = installed_artifact(&spec, &platform)?;

        let written = Configurator::new().ensure_config(&spec, &artifact, &platform)?;
        if written.is_empty() {
            println!("{}", format!("{} declares no configuration files for this host", spec.name).yellow());
            return Ok(());
        }
        for config_file in &written {
            let state = match config_file.outcome {
                ConfigOutcome::Written => "written".green(),
                ConfigOutcome::Unchanged => "unchanged".dimmed(),
            };
            println!("{:<10} {}", state, config_file.path.display());
        }
        Ok(())
    }
}
