// kiln/src/cli/install.rs
use std::sync::Arc;

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::PlanOptions;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::pipeline::{FormulaStatus, RunSummary};
use kiln_core::{run_plan, InstallJob, RunOptions};
use prettytable::{format, Cell, Row, Table};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::cli::{host_platform, status};

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(required = true)]
    names: Vec<String>,

    /// Build the named formulas from their development head
    #[arg(long)]
    head: bool,
    /// Treat optional dependencies as build-gating
    #[arg(long)]
    include_optional: bool,
    /// Number of formulas built at the same time
    #[arg(long, short = 'j', value_name = "N")]
    jobs: Option<usize>,
    /// Run each formula's smoke checks after installing it
    #[arg(long)]
    verify: bool,
}

impl InstallArgs {
    #[instrument(skip(self, config), fields(targets = ?self.names))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let mut config = config.clone();
        if let Some(jobs) = self.jobs {
            if jobs == 0 {
                return Err(KilnError::Config("--jobs must be at least 1".to_string()));
            }
            config.jobs = jobs;
        }

        let platform = host_platform(&config);
        let options = PlanOptions {
            include_optional: self.include_optional,
        };
        let graph = Formulary::new(&config).load_graph(
            &self.names,
            platform.os,
            config.build_root(),
            &options,
        )?;
        let plan = graph.plan_with(&self.names, &options)?;
        println!(
            "{} {}",
            "Build order:".bold(),
            plan.names().join(" → ").cyan()
        );

        let (event_tx, event_rx) = broadcast::channel(1024);
        let display = tokio::spawn(status::handle_events(event_rx));

        let mut job = InstallJob::new(&config, platform, Handle::current(), event_tx.clone())?;
        if self.head {
            job = job.with_head(self.names.iter().cloned());
        }
        if self.verify {
            job = job.verifying(&config);
        }
        let job = Arc::new(job);
        let run_options = RunOptions::from_config(&config);

        // The workers block on the runtime for downloads, so the pool is waited on elsewhere.
        let summary = tokio::task::spawn_blocking(move || {
            run_plan(&plan, job, run_options, &event_tx)
        })
        .await
        .map_err(|e| KilnError::Generic(format!("Build orchestrator stopped unexpectedly: {e}")))?;

        if let Err(e) = display.await {
            debug!("Status display ended abnormally: {}", e);
        }

        print_summary(&summary);

        if summary.is_success() {
            Ok(())
        } else {
            Err(KilnError::Generic(format!(
                "{} formula(s) failed, {} skipped",
                summary.failed(),
                summary.skipped()
            )))
        }
    }
}

fn print_summary(summary: &RunSummary) {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.add_row(Row::new(vec![
        Cell::new("Formula").style_spec("b"),
        Cell::new("Status").style_spec("b"),
        Cell::new("Detail").style_spec("b"),
    ]));
    for (name, status) in &summary.statuses {
        let (label, style, detail) = match status {
            FormulaStatus::Done => ("done", "Fg", String::new()),
            FormulaStatus::Failed { reason } => ("failed", "Fr", reason.clone()),
            FormulaStatus::Skipped { failed_dependency } => (
                "skipped",
                "Fy",
                format!("dependency '{failed_dependency}' failed"),
            ),
        };
        table.add_row(Row::new(vec![
            Cell::new(name).style_spec("Fb"),
            Cell::new(label).style_spec(style),
            Cell::new(&detail),
        ]));
    }
    println!();
    table.printstd();
    println!(
        "{}",
        format!(
            "{} built, {} failed, {} skipped in {}",
            summary.succeeded(),
            summary.failed(),
            summary.skipped(),
            humantime::format_duration(std::time::Duration::from_secs(
                summary.duration_secs.round() as u64
            ))
        )
        .bold()
    );
}
