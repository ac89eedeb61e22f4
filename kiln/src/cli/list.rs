// kiln/src/cli/list.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::{InstalledKeg, KegRegistry};
use prettytable::{format, Cell, Row, Table};
use tracing::warn;

#[derive(Args, Debug)]
pub struct List {
    /// Show all installed versions, not just the latest for each name
    #[arg(long)]
    pub all: bool,
}

impl List {
    pub fn run(&self, config: &Config) -> Result<()> {
        let registry = KegRegistry::new(config.clone());
        let installed = registry.list_installed_kegs()?;
        let kegs = if self.all {
            installed
        } else {
            latest_per_name(installed)
        };

        if kegs.is_empty() {
            println!("{}", "0 formulas installed".yellow());
            return Ok(());
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Name").style_spec("b"),
            Cell::new("Version").style_spec("b"),
            Cell::new("Installed").style_spec("b"),
            Cell::new("Files").style_spec("b"),
        ]));
        for keg in &kegs {
            let receipt = match registry.read_receipt(keg) {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!("Unreadable receipt for {} {}: {}", keg.name, keg.version_str, e);
                    None
                }
            };
            let (installed_at, files) = match &receipt {
                Some(r) => (
                    r.installed_at.format("%Y-%m-%d %H:%M").to_string(),
                    r.files.len().to_string(),
                ),
                None => ("-".to_string(), "-".to_string()),
            };
            table.add_row(Row::new(vec![
                Cell::new(&keg.name).style_spec("Fb"),
                Cell::new(&keg.version_str),
                Cell::new(&installed_at),
                Cell::new(&files),
            ]));
        }
        table.printstd();
        println!("{}", format!("{} formulas installed", kegs.len()).bold());
        Ok(())
    }
}

// `list_installed_kegs` groups by name with the newest version last.
fn latest_per_name(kegs: Vec<InstalledKeg>) -> Vec<InstalledKeg> {
    let mut latest: Vec<InstalledKeg> = Vec::new();
    for keg in kegs {
        match latest.last_mut() {
            Some(last) if last.name == keg.name => *last = keg,
            _ => latest.push(keg),
        }
    }
    latest
}
