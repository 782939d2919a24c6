// kiln/src/cli/plan.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::PlanOptions;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::model::platform::OsFamily;

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[arg(required = true)]
    names: Vec<String>,

    /// Treat optional dependencies as build-gating
    #[arg(long)]
    include_optional: bool,
}

impl PlanArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let options = PlanOptions {
            include_optional: self.include_optional,
        };
        let graph = Formulary::new(config).load_graph(
            &self.names,
            OsFamily::current(),
            config.build_root(),
            &options,
        )?;
        let plan = graph.plan_with(&self.names, &options)?;

        for (index, entry) in plan.iter().enumerate() {
            let deps = if entry.dependencies.is_empty() {
                String::new()
            } else {
                format!(" (after {})", entry.dependencies.join(", "))
                    .dimmed()
                    .to_string()
            };
            println!(
                "{:>3}. {} {}{}",
                index + 1,
                entry.name().cyan(),
                entry.formula.version,
                deps
            );
        }
        Ok(())
    }
}
