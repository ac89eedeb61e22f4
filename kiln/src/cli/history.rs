// kiln/src/cli/history.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use prettytable::{format, Cell, Row, Table};

/// Every published version of a formula, oldest first.
#[derive(Args, Debug)]
pub struct History {
    /// Name of the formula
    pub name: String,
}

impl History {
    pub fn run(&self, config: &Config) -> Result<()> {
        let formulary = Formulary::load(config)?;
        let versions = formulary.versions(&self.name)?;
        if versions.is_empty() {
            return Err(KilnError::NotFound(format!(
                "Formula '{}' not found in any formula directory",
                self.name
            )));
        }
        let latest = formulary.load_formula(&self.name)?;

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Version").style_spec("b"),
            Cell::new("SHA-256").style_spec("b"),
            Cell::new("Source").style_spec("b"),
            Cell::new(""),
        ]));
        for record in &versions {
            let is_latest = record.id() == latest.id();
            table.add_row(Row::new(vec![
                Cell::new(&record.version).style_spec(if is_latest { "Fg" } else { "" }),
                Cell::new(&record.sha256),
                Cell::new(&record.url),
                Cell::new(if is_latest { "latest" } else { "" }),
            ]));
        }
        table.printstd();
        println!(
            "{}",
            format!("{} versions of {}", versions.len(), self.name).bold()
        );
        Ok(())
    }
}
