// kiln/src/cli/install.rs
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::model::artifact::InstalledArtifact;
use kiln_common::model::formula::FormulaRecord;
use kiln_core::{CancelSignal, Pipeline};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

use crate::cli::status;

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Formula names, or paths to `.json` / `.rb` formula files
    #[arg(required = true)]
    targets: Vec<String>,

    /// Skip the post-install self-test
    #[arg(long)]
    skip_test: bool,

    /// Keep the temporary build tree for inspection
    #[arg(long)]
    keep_build_dir: bool,
}

impl InstallArgs {
    #[instrument(skip(self, config, cancel), fields(targets = ?self.targets))]
    pub async fn run(&self, mut config: Config, cancel: CancelSignal) -> Result<()> {
        config.skip_test |= self.skip_test;
        config.keep_build_dir |= self.keep_build_dir;

        let formulary = Arc::new(Formulary::load(&config)?);
        let records = self.resolve_targets(&formulary)?;

        let pipeline = Pipeline::new(config, Arc::clone(&formulary))?.with_cancel(cancel);
        let printer = tokio::spawn(status::handle_events(pipeline.subscribe()));

        let mut set = JoinSet::new();
        for record in records {
            let pipeline = pipeline.clone();
            set.spawn(async move { pipeline.install_package(record).await });
        }
        // The printer stops once every pipeline handle is gone.
        drop(pipeline);

        let mut installed: Vec<InstalledArtifact> = Vec::new();
        let mut failures = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(artifact)) => installed.push(artifact),
                Ok(Err(err)) => {
                    debug!("Install failed: {}", err);
                    failures += 1;
                }
                Err(join_err) => {
                    error!("Install task panicked or was aborted: {}", join_err);
                    failures += 1;
                }
            }
        }

        let summary = match printer.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Status printer failed: {}", e);
                status::StatusSummary::default()
            }
        };

        installed.sort_by(|a, b| a.name.cmp(&b.name));
        for artifact in &installed {
            print_caveats(artifact);
        }

        println!(
            "\n{}: {}  {}: {}  {}: {}",
            "Installed".green().bold(),
            summary.succeeded.len(),
            "Failed".red().bold(),
            summary.failed.len(),
            "Warnings".yellow().bold(),
            summary.warnings.len()
        );

        if failures > 0 {
            return Err(KilnError::Install(format!(
                "{failures} of {} targets failed to install",
                self.targets.len()
            )));
        }
        Ok(())
    }

    /// Maps each argument to a record. Paths are loaded and published into
    /// the formulary so their dependencies can refer to each other.
    fn resolve_targets(&self, formulary: &Formulary) -> Result<Vec<Arc<FormulaRecord>>> {
        let mut records = Vec::new();
        for target in &self.targets {
            if is_formula_path(target) {
                let loaded = formulary.load_file(Path::new(target))?;
                if loaded.is_empty() {
                    return Err(KilnError::InvalidFormula {
                        name: target.clone(),
                        reason: "file holds no formula records".to_string(),
                    });
                }
                records.extend(loaded);
            } else {
                records.push(formulary.load_formula(target)?);
            }
        }
        Ok(dedup_records(records))
    }
}

// First occurrence wins, wherever the repeats are.
fn dedup_records(mut records: Vec<Arc<FormulaRecord>>) -> Vec<Arc<FormulaRecord>> {
    let mut seen = HashSet::new();
    records.retain(|r| seen.insert(r.id()));
    records
}

// Only `.json` and `.rb` files are loadable; anything else is a formula name.
fn is_formula_path(target: &str) -> bool {
    matches!(
        Path::new(target).extension().and_then(|e| e.to_str()),
        Some("json") | Some("rb")
    )
}

fn print_caveats(artifact: &InstalledArtifact) {
    let Some(caveats) = artifact.caveats.as_deref() else {
        return;
    };
    if caveats.trim().is_empty() {
        return;
    }
    println!("\n{} {}", "==> Caveats for".bold().blue(), artifact.name.cyan());
    println!("{caveats}");
}
