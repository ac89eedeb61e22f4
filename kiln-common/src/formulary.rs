// kiln-common/src/formulary.rs
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::config::Config;
use super::error::{KilnError, Result};
use super::formula_dsl;
use super::model::formula::FormulaRecord;
use super::model::history::VersionHistory;

/// Every formula record known from the configured formula directories,
/// plus anything published at runtime.
#[derive(Debug, Default)]
pub struct Formulary {
    history: RwLock<VersionHistory>,
}

impl Formulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.json` and `*.rb` file from the configured formula paths.
    /// Directories that do not exist are skipped.
    pub fn load(config: &Config) -> Result<Self> {
        let formulary = Self::new();
        for dir in &config.formula_paths {
            formulary.load_dir(dir)?;
        }
        Ok(formulary)
    }

    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            debug!("Formula directory {} does not exist, skipping", dir.display());
            return Ok(0);
        }
        let mut entries: Vec<_> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        let mut loaded = 0;
        for path in entries {
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") | Some("rb") => {
                    loaded += self.load_file(&path)?.len();
                }
                _ => debug!("Ignoring non-formula file {}", path.display()),
            }
        }
        debug!("Loaded {} formula records from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Loads one file. A JSON file may hold a single record or an array.
    pub fn load_file(&self, path: &Path) -> Result<Vec<Arc<FormulaRecord>>> {
        let raw = fs::read_to_string(path)?;
        let records = match path.extension().and_then(|e| e.to_str()) {
            Some("rb") => {
                let stem = path.file_stem().and_then(|s| s.to_str());
                vec![formula_dsl::parse_formula(&raw, stem)?]
            }
            Some("json") => parse_json_records(&raw)
                .map_err(|e| KilnError::ParseError("formula JSON", format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(KilnError::InvalidFormula {
                    name: path.display().to_string(),
                    reason: "expected a .json or .rb formula file".to_string(),
                })
            }
        };

        let mut published = Vec::with_capacity(records.len());
        for record in records {
            published.push(self.publish(record.normalized()?)?);
        }
        Ok(published)
    }

    /// Validates and appends a record to the history.
    pub fn publish(&self, record: FormulaRecord) -> Result<Arc<FormulaRecord>> {
        for warning in record.validate()? {
            warn!("{}", warning);
        }
        let mut history = self
            .history
            .write()
            .map_err(|_| KilnError::Generic("formulary lock poisoned".to_string()))?;
        history.publish(record)
    }

    /// Latest published version of `name`.
    pub fn load_formula(&self, name: &str) -> Result<Arc<FormulaRecord>> {
        self.with_history(|h| h.latest(name))?
            .ok_or_else(|| KilnError::NotFound(format!("Formula '{name}' not found in any formula directory")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.with_history(|h| h.contains(name)).unwrap_or(false)
    }

    pub fn versions(&self, name: &str) -> Result<Vec<Arc<FormulaRecord>>> {
        self.with_history(|h| h.versions(name).to_vec())
    }

    pub fn names(&self) -> Result<Vec<String>> {
        self.with_history(|h| h.names().map(str::to_string).collect())
    }

    fn with_history<T>(&self, f: impl FnOnce(&VersionHistory) -> T) -> Result<T> {
        let history = self
            .history
            .read()
            .map_err(|_| KilnError::Generic("formulary lock poisoned".to_string()))?;
        Ok(f(&history))
    }
}

fn parse_json_records(raw: &str) -> serde_json::Result<Vec<FormulaRecord>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if value.is_array() {
        serde_json::from_value(value)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}
