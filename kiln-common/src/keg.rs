// kiln-common/src/keg.rs
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::artifact::{InstallReceipt, RECEIPT_FILE_NAME};
use super::model::version;

/// Represents information about an installed package (Keg).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKeg {
    pub name: String,
    pub version_str: String,
    pub path: PathBuf,
}

impl InstalledKeg {
    pub fn receipt_path(&self) -> PathBuf {
        self.path.join(RECEIPT_FILE_NAME)
    }
}

/// Manages querying installed packages in the Cellar.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    config: Config,
}

impl KegRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn formula_cellar_path(&self, name: &str) -> PathBuf {
        self.config.formula_cellar_dir(name)
    }

    pub fn get_opt_path(&self, name: &str) -> PathBuf {
        self.config.formula_opt_path(name)
    }

    /// The newest installed version of `name`, if any.
    pub fn get_installed_keg(&self, name: &str) -> Result<Option<InstalledKeg>> {
        let formula_dir = self.formula_cellar_path(name);
        debug!(
            "[KEG_REGISTRY:{}] get_installed_keg: checking {}",
            name,
            formula_dir.display()
        );

        if !formula_dir.is_dir() {
            debug!("[KEG_REGISTRY:{}] get_installed_keg: no cellar entry", name);
            return Ok(None);
        }

        let kegs = self.read_versions(name, &formula_dir).map_err(|e| {
            error!(
                "[KEG_REGISTRY:{}] get_installed_keg: failed to read '{}': {}",
                name,
                formula_dir.display(),
                e
            );
            e
        })?;
        let latest = kegs.into_iter().max_by(|a, b| newer(&a.version_str, &b.version_str));

        match &latest {
            Some(keg) => debug!(
                "[KEG_REGISTRY:{}] get_installed_keg: latest keg is {} at {}",
                name,
                keg.version_str,
                keg.path.display()
            ),
            None => debug!(
                "[KEG_REGISTRY:{}] get_installed_keg: cellar entry holds no version directories",
                name
            ),
        }
        Ok(latest)
    }

    pub fn list_installed_kegs(&self) -> Result<Vec<InstalledKeg>> {
        let mut installed_kegs = Vec::new();
        let cellar_dir = self.cellar_path();
        debug!(
            "[KEG_REGISTRY] list_installed_kegs: scanning {}",
            cellar_dir.display()
        );

        if !cellar_dir.is_dir() {
            debug!("[KEG_REGISTRY] list_installed_kegs: cellar not found, nothing installed");
            return Ok(installed_kegs);
        }

        for formula_entry in fs::read_dir(&cellar_dir)? {
            let formula_entry = match formula_entry {
                Ok(fe) => fe,
                Err(e) => {
                    warn!("[KEG_REGISTRY] list_installed_kegs: error reading cellar entry: {}. Skipping.", e);
                    continue;
                }
            };
            let formula_path = formula_entry.path();
            let Some(formula_name) = formula_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !formula_path.is_dir() {
                debug!(
                    "[KEG_REGISTRY] list_installed_kegs: {} is not a directory",
                    formula_path.display()
                );
                continue;
            }
            match self.read_versions(formula_name, &formula_path) {
                Ok(mut kegs) => installed_kegs.append(&mut kegs),
                Err(e) => warn!(
                    "[KEG_REGISTRY:{}] list_installed_kegs: failed to read versions: {}",
                    formula_name, e
                ),
            }
        }

        installed_kegs.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| newer(&a.version_str, &b.version_str))
        });
        debug!(
            "[KEG_REGISTRY] list_installed_kegs: found {} installed keg versions",
            installed_kegs.len()
        );
        Ok(installed_kegs)
    }

    /// Reads `INSTALL_RECEIPT.json` from a keg. Kegs installed by hand have none.
    pub fn read_receipt(&self, keg: &InstalledKeg) -> Result<Option<InstallReceipt>> {
        let path = keg.receipt_path();
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let receipt = serde_json::from_str(&raw).map_err(|e| {
            KilnError::ParseError(
                "install receipt",
                format!("{}: {}", path.display(), e),
            )
        })?;
        Ok(Some(receipt))
    }

    pub fn cellar_path(&self) -> PathBuf {
        self.config.cellar_dir()
    }

    fn read_versions(&self, name: &str, formula_dir: &Path) -> Result<Vec<InstalledKeg>> {
        let mut kegs = Vec::new();
        for entry in fs::read_dir(formula_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(
                        "[KEG_REGISTRY:{}] error reading version entry in '{}': {}. Skipping.",
                        name,
                        formula_dir.display(),
                        e
                    );
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(version_str) = path.file_name().and_then(|n| n.to_str()) {
                kegs.push(InstalledKeg {
                    name: name.to_string(),
                    version_str: version_str.to_string(),
                    path: path.clone(),
                });
            }
        }
        Ok(kegs)
    }
}

// Semver when both parse, byte order otherwise.
fn newer(a: &str, b: &str) -> Ordering {
    version::compare(a, b).unwrap_or_else(|| a.cmp(b))
}
