// kiln/src/cli/info.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::{DependencyExt, DependencyTag};
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::keg::KegRegistry;
use kiln_common::model::formula::FormulaRecord;
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,
}

impl Info {
    pub fn run(&self, config: &Config) -> Result<()> {
        let formulary = Formulary::load(config)?;
        let record = formulary.load_formula(&self.name)?;
        let registry = KegRegistry::new(config.clone());
        let installed = registry.get_installed_keg(&record.name)?;

        print_record(&record);
        if let Some(path) = config.find_formula_file(&record.name) {
            println!("{} {}", "Defined in:".bold(), path.display());
        }

        match installed {
            Some(keg) => println!(
                "{} {} {}",
                "Installed:".bold(),
                keg.version_str.green(),
                keg.path.display().to_string().dimmed()
            ),
            None => println!("{} {}", "Installed:".bold(), "no".dimmed()),
        }

        let dependencies = record.dependencies();
        if !dependencies.is_empty() {
            println!("\n{}", "Dependencies".bold().blue());
            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_CLEAN);
            for dep in &dependencies {
                let (state, style) = if registry.get_installed_keg(&dep.name)?.is_some() {
                    ("installed", "Fg")
                } else if formulary.contains(&dep.name) {
                    ("missing", "Fy")
                } else {
                    ("unknown", "Fr")
                };
                table.add_row(Row::new(vec![
                    Cell::new(&dep.name).style_spec("Fb"),
                    Cell::new(&dep.tags.to_string()),
                    Cell::new(state).style_spec(style),
                ]));
            }
            table.printstd();
            let build_only = dependencies
                .build_time()
                .iter()
                .filter(|d| !d.tags.contains(DependencyTag::RUNTIME))
                .count();
            println!(
                "{} runtime, {} build-only",
                dependencies.runtime().len(),
                build_only
            );
        }

        if let Some(caveats) = record.caveats.as_deref() {
            println!("\n{}", "Caveats".bold().blue());
            println!("{}", caveats.trim_end());
        }
        Ok(())
    }
}

fn print_record(record: &FormulaRecord) {
    println!("{} {}", record.name.green().bold(), record.version);
    if let Some(desc) = &record.desc {
        println!("{desc}");
    }
    if let Some(homepage) = &record.homepage {
        println!("{}", homepage.blue());
    }
    println!("{} {}", "Source:".bold(), record.url);
    println!("{} {}", "SHA-256:".bold(), record.sha256);
    match &record.test {
        Some(test) => println!("{} {}", "Self-test:".bold(), test.command.join(" ")),
        None => println!("{} {}", "Self-test:".bold(), "none".dimmed()),
    }
}
