// kiln-core/src/fetch.rs
// Download-cache handling around a `SourceFetcher`.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::checksum::{sha256_file_async, verify_checksum_async};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::FormulaRecord;
use kiln_common::pipeline::PipelineEvent;
use kiln_net::{archive_file_name, SourceFetcher};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// An archive ready for verification.
#[derive(Debug)]
pub enum FetchedArchive {
    /// Already in the download cache with a matching digest.
    Cached(PathBuf),
    /// Freshly downloaded, not yet verified. Dropping it deletes the file.
    Downloaded {
        file: NamedTempFile,
        cache_path: PathBuf,
    },
}

/// `<name>--<version>--<archive file name>` inside the downloads directory.
pub fn cache_path_for(downloads_dir: &Path, record: &FormulaRecord) -> PathBuf {
    let file_name = archive_file_name(&record.url, &format!("{}.download", record.name));
    downloads_dir.join(format!("{}--{}--{}", record.name, record.version, file_name))
}

pub async fn fetch_archive<F: SourceFetcher>(
    fetcher: &F,
    record: &FormulaRecord,
    downloads_dir: &Path,
    events: &broadcast::Sender<PipelineEvent>,
) -> Result<FetchedArchive> {
    let cache_path = cache_path_for(downloads_dir, record);

    if cache_path.is_file() {
        let actual = sha256_file_async(&cache_path).await?;
        if actual.eq_ignore_ascii_case(&record.sha256) {
            debug!("Using cached archive {}", cache_path.display());
            let _ = events.send(PipelineEvent::DownloadCached {
                target_id: record.name.clone(),
                path: cache_path.clone(),
            });
            return Ok(FetchedArchive::Cached(cache_path));
        }
        warn!(
            "Cached archive {} has digest {}, expected {}; downloading again",
            cache_path.display(),
            actual,
            record.sha256
        );
        fs::remove_file(&cache_path)?;
    }

    fs::create_dir_all(downloads_dir)?;
    let file = tempfile::Builder::new()
        .prefix(&format!(".{}-", record.name))
        .suffix(".download")
        .tempfile_in(downloads_dir)?;

    let _ = events.send(PipelineEvent::DownloadStarted {
        target_id: record.name.clone(),
        url: record.url.clone(),
    });
    match fetcher.fetch(&record.url, file.path()).await {
        Ok(size_bytes) => {
            let _ = events.send(PipelineEvent::DownloadFinished {
                target_id: record.name.clone(),
                path: cache_path.clone(),
                size_bytes,
            });
            Ok(FetchedArchive::Downloaded { file, cache_path })
        }
        Err(e) => {
            let _ = events.send(PipelineEvent::download_failed(
                record.name.clone(),
                record.url.clone(),
                &e,
            ));
            Err(e)
        }
    }
}

/// Verifies a fresh download against the record's digest and moves it into
/// the cache. On mismatch the temporary file is deleted.
pub async fn verify_and_persist(archive: FetchedArchive, record: &FormulaRecord) -> Result<PathBuf> {
    match archive {
        FetchedArchive::Cached(path) => Ok(path),
        FetchedArchive::Downloaded { file, cache_path } => {
            verify_checksum_async(file.path(), &record.sha256).await?;
            file.persist(&cache_path)
                .map_err(|e| KilnError::from(e.error))?;
            debug!("Stored verified archive at {}", cache_path.display());
            Ok(cache_path)
        }
    }
}
