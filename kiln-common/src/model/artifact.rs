// kiln-common/src/model/artifact.rs
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KilnError;

pub const RECEIPT_FILE_NAME: &str = "INSTALL_RECEIPT.json";

/// Name of the payload archive some releases carry inside the primary archive.
pub const EMBEDDED_DATA_MEMBER: &str = "data.tar";

/// How a verified release archive is laid out once placed in the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReleaseLayout {
    /// Sources sit directly in the extracted tree.
    Flat,
    /// Sources are packed in an inner archive that must be extracted in place.
    WithEmbeddedData { member: String },
}

impl ReleaseLayout {
    pub fn detect(source_root: &Path) -> Self {
        if source_root.join(EMBEDDED_DATA_MEMBER).is_file() {
            Self::WithEmbeddedData {
                member: EMBEDDED_DATA_MEMBER.to_string(),
            }
        } else {
            Self::Flat
        }
    }
}

/// Result of a successful install.
#[derive(Debug, Clone)]
pub struct InstalledArtifact {
    pub name: String,
    pub version: String,
    pub keg_path: PathBuf,
    pub opt_path: PathBuf,
    /// Keg-relative paths of every installed file, sorted.
    pub files: Vec<PathBuf>,
    pub layout: ReleaseLayout,
    /// Links created under `<prefix>/bin`.
    pub linked_executables: Vec<PathBuf>,
    /// Caveats with path tokens rendered against the keg.
    pub caveats: Option<String>,
    /// Self-test failures. The install itself stands.
    pub verification_errors: Vec<KilnError>,
    /// Validation and linking warnings.
    pub warnings: Vec<String>,
}

impl InstalledArtifact {
    pub fn self_test_passed(&self) -> bool {
        self.verification_errors.is_empty()
    }
}

/// Persisted as `INSTALL_RECEIPT.json` inside the keg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub sha256: String,
    pub source_url: String,
    pub build_dependencies: Vec<String>,
    pub runtime_dependencies: Vec<String>,
    pub layout: ReleaseLayout,
    pub files: Vec<PathBuf>,
    pub installed_at: DateTime<Utc>,
}
