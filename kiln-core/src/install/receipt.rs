// kiln-core/src/install/receipt.rs
use std::path::{Path, PathBuf};

use chrono::Utc;
use kiln_aio::fs::atomic_write_file;
use kiln_common::error::Result;
use kiln_common::model::artifact::{InstallReceipt, ReleaseLayout, RECEIPT_FILE_NAME};
use kiln_common::model::formula::FormulaRecord;
use tracing::debug;

/// Writes `INSTALL_RECEIPT.json` into the keg.
pub fn write_receipt(
    keg_path: &Path,
    record: &FormulaRecord,
    layout: &ReleaseLayout,
    files: &[PathBuf],
) -> Result<InstallReceipt> {
    let receipt = InstallReceipt {
        name: record.name.clone(),
        version: record.version.clone(),
        sha256: record.sha256.clone(),
        source_url: record.url.clone(),
        build_dependencies: record.build_dependencies.clone(),
        runtime_dependencies: record.runtime_dependencies.clone(),
        layout: layout.clone(),
        files: files.to_vec(),
        installed_at: Utc::now(),
    };
    let path = keg_path.join(RECEIPT_FILE_NAME);
    let json = serde_json::to_vec_pretty(&receipt)?;
    atomic_write_file(&path, &json)?;
    debug!("Wrote install receipt {}", path.display());
    Ok(receipt)
}
