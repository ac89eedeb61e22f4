// kiln-aio/src/fs.rs
// Filesystem helpers shared by install, linking and receipts.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::error::{KilnError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Creates a symbolic link. Unix only.
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    debug!("Creating symlink {} -> {}", link.display(), target.display());
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        error!(
            "Failed create symlink {} -> {}: {}",
            link.display(),
            target.display(),
            e
        );
        KilnError::from(e)
    })
}

#[cfg(not(unix))]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    warn!(
        "Symlink creation not supported on this platform: {} -> {}",
        link.display(),
        target.display()
    );
    Err(KilnError::Generic(
        "Symlinks not supported on this platform".to_string(),
    ))
}

/// Removes a file, symlink or directory tree. A missing path is not an error.
pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    debug!("Removing {}", path.display());
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| {
        error!("Failed to remove {}: {}", path.display(), e);
        KilnError::from(e)
    })
}

/// Atomically writes data to a file using a temporary file in the same directory.
pub fn atomic_write_file(original_path: &Path, content: &[u8]) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        KilnError::Install(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    fs::create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    debug!(
        "Atomically writing {} bytes to {} via {}",
        content.len(),
        original_path.display(),
        temp_file.path().display()
    );
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    let temp_file = temp_file.persist(original_path).map_err(|e| {
        error!(
            "Failed to persist temporary file over {}: {}",
            original_path.display(),
            e.error
        );
        KilnError::Io(Arc::new(e.error))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = temp_file.set_permissions(fs::Permissions::from_mode(0o644)) {
            warn!(
                "Failed to set permissions on {}: {}",
                original_path.display(),
                e
            );
        }
    }
    #[cfg(not(unix))]
    drop(temp_file);
    Ok(())
}

/// Every file and symlink under `root`, relative to it, sorted.
pub fn list_files_relative(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            KilnError::Io(Arc::new(io::Error::other(format!(
                "Failed to walk {}: {}",
                root.display(),
                e
            ))))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_nested_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::create_dir_all(dir.path().join("share/qvm-ffmpeg")).unwrap();
        fs::write(dir.path().join("share/qvm-ffmpeg/config.json"), b"{}").unwrap();
        fs::write(dir.path().join("bin/quran-video-maker"), b"#!/bin/sh\n").unwrap();

        let files = list_files_relative(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("bin/quran-video-maker"),
                PathBuf::from("share/qvm-ffmpeg/config.json")
            ]
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/receipt.json");
        atomic_write_file(&path, b"first").unwrap();
        atomic_write_file(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn removing_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_path_if_exists(&dir.path().join("nope")).unwrap();
        let sub = dir.path().join("keg");
        fs::create_dir_all(sub.join("lib")).unwrap();
        remove_path_if_exists(&sub).unwrap();
        assert!(!sub.exists());
    }

    #[cfg(unix)]
    #[test]
    fn removes_symlink_not_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let link = dir.path().join("link");
        create_symlink(&target, &link).unwrap();
        remove_path_if_exists(&link).unwrap();
        assert!(target.is_dir());
        assert!(link.symlink_metadata().is_err());
    }
}
