// kiln/src/cli/info.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::model::formula::FormulaSpec;
use prettytable::{format, row, Table};

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,

    /// Print the parsed description as JSON
    #[arg(long)]
    pub json: bool,
}

impl Info {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let spec = Formulary::new(config).load_formula(&self.name)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&*spec)?);
            return Ok(());
        }
        print_formula_info(&spec);
        Ok(())
    }
}

fn print_formula_info(spec: &FormulaSpec) {
    println!("{} {}", spec.name.green().bold(), spec.version);
    if let Some(desc) = &spec.desc {
        println!("{desc}");
    }
    if let Some(homepage) = &spec.homepage {
        println!("{}", homepage.blue());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_CLEAN);
    if let Some(license) = &spec.license {
        table.add_row(row!["License", license.to_string()]);
    }
    if let Some(source) = spec.main_source() {
        table.add_row(row!["Source", source.url]);
    }
    if let Some(head) = &spec.head {
        table.add_row(row!["Head", head.url]);
    }
    if let Some(reason) = &spec.keg_only {
        table.add_row(row!["Keg-only", reason]);
    }
    table.printstd();

    if !spec.dependencies.is_empty() {
        println!("\n{}", "Dependencies".bold());
        let mut deps = Table::new();
        deps.set_format(*format::consts::FORMAT_CLEAN);
        for dep in &spec.dependencies {
            let scope = match (dep.os, dep.uses_from_macos) {
                (Some(os), _) => format!("{} only", os),
                (None, true) => "system on macos".to_string(),
                (None, false) => String::new(),
            };
            deps.add_row(row![dep.name, dep.tags.to_string(), scope]);
        }
        deps.printstd();
    }

    if !spec.resources.is_empty() {
        println!("\n{}", "Resources".bold());
        let mut resources = Table::new();
        resources.set_format(*format::consts::FORMAT_CLEAN);
        for resource in &spec.resources {
            resources.add_row(row![resource.name, resource.source.url]);
        }
        resources.printstd();
    }

    if !spec.patches.is_empty() {
        println!("\n{} {}", "Patches:".bold(), spec.patches.len());
    }

    if let Some(caveats) = &spec.caveats {
        println!("\n{}", "Caveats".bold());
        println!("{}", caveats.trim_end());
    }
}
