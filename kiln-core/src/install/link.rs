// kiln-core/src/install/link.rs
use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::fs::{create_symlink, remove_path_if_exists};
use kiln_common::config::Config;
use kiln_common::error::Result;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct LinkReport {
    pub opt_path: PathBuf,
    pub linked_executables: Vec<PathBuf>,
    /// Links that were skipped because something else owns the path.
    pub warnings: Vec<String>,
}

/// Links a keg into the prefix: `opt/<name>` to the keg and every executable
/// in `<keg>/bin` into `<prefix>/bin`. Existing links into the same formula's
/// cellar are replaced. Anything else at a link path is left alone and
/// reported as a warning.
pub fn link_keg(config: &Config, name: &str, keg_path: &Path) -> Result<LinkReport> {
    debug!("Linking {} from {}", name, keg_path.display());
    let formula_cellar = config.formula_cellar_dir(name);
    let mut report = LinkReport {
        opt_path: config.formula_opt_path(name),
        ..LinkReport::default()
    };

    fs::create_dir_all(config.opt_dir())?;
    if replace_link(keg_path, &report.opt_path, &formula_cellar, &mut report.warnings)? {
        debug!(
            "  Linked opt path: {} -> {}",
            report.opt_path.display(),
            keg_path.display()
        );
    }

    let source_bin_dir = keg_path.join("bin");
    if source_bin_dir.is_dir() {
        let target_bin_dir = config.bin_dir();
        fs::create_dir_all(&target_bin_dir)?;

        let mut entries: Vec<PathBuf> = fs::read_dir(&source_bin_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for source in entries {
            let Some(file_name) = source.file_name() else {
                continue;
            };
            if file_name.to_string_lossy().starts_with('.') || !is_executable(&source) {
                continue;
            }
            let link = target_bin_dir.join(file_name);
            if replace_link(&source, &link, &formula_cellar, &mut report.warnings)? {
                debug!("  Linked {} -> {}", link.display(), source.display());
                report.linked_executables.push(link);
            }
        }
    }

    Ok(report)
}

// Returns false when the path is occupied by something this formula does not own.
fn replace_link(
    target: &Path,
    link: &Path,
    formula_cellar: &Path,
    warnings: &mut Vec<String>,
) -> Result<bool> {
    match fs::symlink_metadata(link) {
        Err(_) => {}
        Ok(meta) if meta.file_type().is_symlink() => {
            let points_into_cellar = fs::read_link(link)
                .map(|dest| dest.starts_with(formula_cellar))
                .unwrap_or(false);
            if !points_into_cellar {
                let msg = format!(
                    "{} is a link owned by another package; not replacing it",
                    link.display()
                );
                warn!("{}", msg);
                warnings.push(msg);
                return Ok(false);
            }
            remove_path_if_exists(link)?;
        }
        Ok(_) => {
            let msg = format!("{} already exists and is not a link; not replacing it", link.display());
            warn!("{}", msg);
            warnings.push(msg);
            return Ok(false);
        }
    }
    create_symlink(target, link)?;
    Ok(true)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn make_keg(config: &Config, name: &str, version: &str, exes: &[&str]) -> PathBuf {
        let keg = config.formula_keg_path(name, version);
        fs::create_dir_all(keg.join("bin")).unwrap();
        for exe in exes {
            let p = keg.join("bin").join(exe);
            fs::write(&p, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).unwrap();
        }
        keg
    }

    #[test]
    fn links_opt_and_executables() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let keg = make_keg(&config, "qvm-ffmpeg", "0.0.0-test2-g", &["quran-video-maker"]);
        fs::write(keg.join("bin/README"), "not executable").unwrap();

        let report = link_keg(&config, "qvm-ffmpeg", &keg).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(fs::read_link(&report.opt_path).unwrap(), keg);
        assert_eq!(
            report.linked_executables,
            vec![config.bin_dir().join("quran-video-maker")]
        );
        assert!(!config.bin_dir().join("README").exists());
    }

    #[test]
    fn relinking_a_new_version_replaces_own_links() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let old = make_keg(&config, "cmake", "3.30.0", &["cmake"]);
        let new = make_keg(&config, "cmake", "3.31.1", &["cmake"]);

        link_keg(&config, "cmake", &old).unwrap();
        let report = link_keg(&config, "cmake", &new).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(fs::read_link(config.bin_dir().join("cmake")).unwrap(), new.join("bin/cmake"));
        assert_eq!(fs::read_link(config.formula_opt_path("cmake")).unwrap(), new);
    }

    #[test]
    fn foreign_files_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let keg = make_keg(&config, "hello", "2.12.1", &["hello", "greet"]);

        fs::create_dir_all(config.bin_dir()).unwrap();
        fs::write(config.bin_dir().join("hello"), "user script").unwrap();
        let other = make_keg(&config, "other", "1.0", &["greet"]);
        create_symlink(&other.join("bin/greet"), &config.bin_dir().join("greet")).unwrap();

        let report = link_keg(&config, "hello", &keg).unwrap();
        assert_eq!(report.warnings.len(), 2);
        assert!(report.linked_executables.is_empty());
        assert_eq!(
            fs::read_to_string(config.bin_dir().join("hello")).unwrap(),
            "user script"
        );
        assert_eq!(
            fs::read_link(config.bin_dir().join("greet")).unwrap(),
            other.join("bin/greet")
        );
    }
}
