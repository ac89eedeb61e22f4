// kiln-aio/src/extract.rs
// Archive extraction with path-safety checks. Blocking; async callers go
// through `extract_archive_async`.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tar::{Archive, EntryType};
use tracing::{debug, error, warn};
use xz2::read::XzDecoder;
use zip::read::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::TarXz => "tar.xz",
            Self::Zip => "zip",
        };
        f.write_str(s)
    }
}

impl ArchiveType {
    /// Sniffs the magic bytes first and falls back to the file extension.
    pub fn detect(path: &Path) -> Result<Self> {
        if let Some(kind) = infer::get_from_path(path)? {
            debug!("Sniffed {} as {}", path.display(), kind.mime_type());
            match kind.extension() {
                "gz" => return Ok(Self::TarGz),
                "bz2" => return Ok(Self::TarBz2),
                "xz" => return Ok(Self::TarXz),
                "tar" => return Ok(Self::Tar),
                "zip" => return Ok(Self::Zip),
                _ => {}
            }
        }
        Self::from_extension(path).ok_or_else(|| {
            KilnError::Unpack(format!(
                "{} is not a recognized archive (tar, tar.gz, tar.bz2, tar.xz, zip)",
                path.display()
            ))
        })
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz") || name.ends_with(".tbz2") {
            Self::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::TarXz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else {
            return None;
        };
        Some(kind)
    }
}

fn open_tar_stream(path: &Path, kind: ArchiveType) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| {
        KilnError::Io(std::sync::Arc::new(io::Error::new(
            e.kind(),
            format!("Failed to open archive {}: {}", path.display(), e),
        )))
    })?;
    Ok(match kind {
        ArchiveType::Tar => Box::new(file),
        ArchiveType::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveType::TarBz2 => Box::new(BzDecoder::new(file)),
        ArchiveType::TarXz => Box::new(XzDecoder::new(file)),
        ArchiveType::Zip => {
            return Err(KilnError::Unpack(format!(
                "{} is a zip archive, not a tar stream",
                path.display()
            )))
        }
    })
}

/// The single top-level directory every entry lives under, if there is one.
/// A lone top-level file does not count as a root.
pub fn infer_archive_root_dir(archive_path: &Path, kind: ArchiveType) -> Result<Option<PathBuf>> {
    debug!(
        "Inferring root directory for archive: {}",
        archive_path.display()
    );
    let entries: Vec<(PathBuf, bool)> = match kind {
        ArchiveType::Zip => {
            let file = File::open(archive_path)?;
            let mut archive = ZipArchive::new(file).map_err(|e| unpack_err(archive_path, e))?;
            let mut out = Vec::with_capacity(archive.len());
            for i in 0..archive.len() {
                let entry = archive.by_index_raw(i).map_err(|e| unpack_err(archive_path, e))?;
                out.push((PathBuf::from(entry.name()), entry.is_dir()));
            }
            out
        }
        _ => {
            let mut archive = Archive::new(open_tar_stream(archive_path, kind)?);
            let mut out = Vec::new();
            for entry in archive.entries().map_err(|e| unpack_err(archive_path, e))? {
                let entry = entry.map_err(|e| unpack_err(archive_path, e))?;
                let is_dir = entry.header().entry_type() == EntryType::Directory;
                let path = entry.path().map_err(|e| unpack_err(archive_path, e))?.into_owned();
                out.push((path, is_dir));
            }
            out
        }
    };

    let mut roots = HashSet::new();
    let mut root_is_dir = false;
    for (path, is_dir) in &entries {
        let mut components = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir));
        match components.next() {
            Some(Component::Normal(name)) => {
                roots.insert(PathBuf::from(name));
                if *is_dir || components.next().is_some() {
                    root_is_dir = true;
                }
            }
            Some(other) => {
                debug!(
                    "Non-standard top-level component ({:?}) in {}, no single root",
                    other,
                    archive_path.display()
                );
                return Ok(None);
            }
            None => continue,
        }
        if roots.len() > 1 {
            debug!(
                "Multiple top-level items in {}, cannot infer single root",
                archive_path.display()
            );
            return Ok(None);
        }
    }

    if roots.is_empty() {
        warn!("Archive {} appears to be empty", archive_path.display());
        return Ok(None);
    }
    let root = roots.into_iter().next().filter(|_| root_is_dir);
    if let Some(r) = &root {
        debug!(
            "Inferred single root directory in {}: {}",
            archive_path.display(),
            r.display()
        );
    }
    Ok(root)
}

/// Extracts `archive_path` into `target_dir`, dropping the first
/// `strip_components` path components of every entry.
pub fn extract_archive(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: usize,
    kind: ArchiveType,
) -> Result<()> {
    debug!(
        "Extracting archive '{}' (type: {}) to '{}' (strip_components={})",
        archive_path.display(),
        kind,
        target_dir.display(),
        strip_components
    );
    fs::create_dir_all(target_dir)?;

    match kind {
        ArchiveType::Zip => extract_zip_archive(archive_path, target_dir, strip_components),
        _ => extract_tar_archive(
            open_tar_stream(archive_path, kind)?,
            target_dir,
            strip_components,
            archive_path,
        ),
    }
}

/// Detects the archive type, strips a single top-level directory when there
/// is one, and extracts into `target_dir`.
pub fn extract_source_archive(archive_path: &Path, target_dir: &Path) -> Result<ArchiveType> {
    let kind = ArchiveType::detect(archive_path)?;
    let strip = usize::from(infer_archive_root_dir(archive_path, kind)?.is_some());
    extract_archive(archive_path, target_dir, strip, kind)?;
    Ok(kind)
}

pub async fn extract_archive_async(archive_path: &Path, target_dir: &Path) -> Result<ArchiveType> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_source_archive(&archive_path, &target_dir))
        .await
        .map_err(|e| KilnError::Unpack(format!("extraction task failed: {e}")))?
}

/// Maps an archive entry path onto `target_dir`, rejecting anything that
/// would land outside it.
fn safe_target_path(
    target_dir: &Path,
    entry_path: &Path,
    strip_components: usize,
) -> std::result::Result<Option<PathBuf>, String> {
    let stripped: Vec<Component<'_>> = entry_path.components().skip(strip_components).collect();
    if stripped.is_empty() {
        return Ok(None);
    }
    let mut out = target_dir.to_path_buf();
    for comp in stripped {
        match comp {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(format!(
                    "Unsafe component {:?} in archive path {}",
                    comp,
                    entry_path.display()
                ));
            }
        }
    }
    if out == target_dir {
        return Ok(None);
    }
    Ok(Some(out))
}

#[cfg(unix)]
struct DeferredHardLink {
    link_path: PathBuf,
    target_in_archive: PathBuf,
}

fn extract_tar_archive<R: Read>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    #[cfg(unix)]
    let mut deferred_hardlinks: Vec<DeferredHardLink> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| unpack_err(archive_path_for_log, e))?
    {
        let mut entry = entry.map_err(|e| unpack_err(archive_path_for_log, e))?;
        let original_path = entry
            .path()
            .map_err(|e| unpack_err(archive_path_for_log, e))?
            .into_owned();

        let target_path = match safe_target_path(target_dir, &original_path, strip_components) {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(msg) => {
                error!("{} in {}", msg, archive_path_for_log.display());
                errors.push(msg);
                continue;
            }
        };

        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        if entry.header().entry_type() == EntryType::Link {
            match entry.link_name() {
                Ok(Some(target)) => {
                    deferred_hardlinks.push(DeferredHardLink {
                        link_path: target_path,
                        target_in_archive: target.into_owned(),
                    });
                }
                _ => errors.push(format!(
                    "Hardlink entry '{}' has no link target",
                    original_path.display()
                )),
            }
            continue;
        }

        if let Err(e) = entry.unpack(&target_path) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                let msg = format!(
                    "Failed to unpack entry {} to {}: {}",
                    original_path.display(),
                    target_path.display(),
                    e
                );
                error!("{}", msg);
                errors.push(msg);
            }
        }
    }

    #[cfg(unix)]
    for deferred in deferred_hardlinks {
        let target =
            match safe_target_path(target_dir, &deferred.target_in_archive, strip_components) {
                Ok(Some(p)) if p.exists() => p,
                _ => {
                    errors.push(format!(
                        "Hardlink target '{}' for '{}' is missing or unsafe",
                        deferred.target_in_archive.display(),
                        deferred.link_path.display()
                    ));
                    continue;
                }
            };
        if deferred.link_path.symlink_metadata().is_ok() {
            let _ = fs::remove_file(&deferred.link_path);
        }
        if let Err(e) = fs::hard_link(&target, &deferred.link_path) {
            errors.push(format!(
                "Failed to create hardlink '{}' -> '{}': {}",
                deferred.link_path.display(),
                target.display(),
                e
            ));
        }
    }

    if !errors.is_empty() {
        return Err(KilnError::Unpack(format!(
            "Failed during TAR extraction for {} with {} error(s): {}",
            archive_path_for_log.display(),
            errors.len(),
            errors.join("; ")
        )));
    }
    debug!(
        "Finished TAR extraction for {}",
        archive_path_for_log.display()
    );
    Ok(())
}

fn extract_zip_archive(archive_path: &Path, target_dir: &Path, strip_components: usize) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| unpack_err(archive_path, e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| unpack_err(archive_path, e))?;
        let entry_path = PathBuf::from(entry.name());
        let target_path = match safe_target_path(target_dir, &entry_path, strip_components) {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(msg) => {
                error!("{} in {}", msg, archive_path.display());
                return Err(KilnError::Unpack(msg));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&target_path)?;
            continue;
        }
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&target_path)?;
        io::copy(&mut entry, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&target_path, fs::Permissions::from_mode(mode)) {
                warn!(
                    "Failed to set permissions on {}: {}",
                    target_path.display(),
                    e
                );
            }
        }
    }
    debug!("Finished ZIP extraction for {}", archive_path.display());
    Ok(())
}

fn unpack_err(archive_path: &Path, e: impl fmt::Display) -> KilnError {
    KilnError::Unpack(format!("{}: {}", archive_path.display(), e))
}
