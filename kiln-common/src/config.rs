// kiln-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{KilnError, Result};

// Used when KILN_PREFIX is not set or is empty.
const DEFAULT_KILN_PREFIX: &str = "/opt/kiln";

#[derive(Debug, Clone)]
pub struct Config {
    pub kiln_root: PathBuf,
    /// Overrides `<prefix>/kiln_cache` when set.
    pub cache_root: Option<PathBuf>,
    /// Directories searched for `*.json` and `*.rb` formula definitions.
    pub formula_paths: Vec<PathBuf>,
    pub make_jobs: usize,
    pub keep_build_dir: bool,
    pub skip_test: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration");

        let root = env::var("KILN_PREFIX")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                debug!(
                    "KILN_PREFIX not set or empty, falling back to default: {}",
                    DEFAULT_KILN_PREFIX
                );
                DEFAULT_KILN_PREFIX.to_string()
            });
        let mut config = Self::with_root(PathBuf::from(root));

        if let Some(cache) = env::var_os("KILN_CACHE").filter(|s| !s.is_empty()) {
            config.cache_root = Some(PathBuf::from(cache));
        }
        if let Some(paths) = env::var_os("KILN_FORMULA_PATH").filter(|s| !s.is_empty()) {
            config.formula_paths = env::split_paths(&paths).collect();
        }
        if let Ok(jobs) = env::var("KILN_MAKE_JOBS") {
            config.make_jobs = parse_jobs(&jobs)?;
        }
        config.keep_build_dir = env_flag("KILN_KEEP_BUILD_DIR");
        config.skip_test = env_flag("KILN_NO_TEST");

        debug!("Effective KILN_PREFIX set to: {}", config.kiln_root.display());
        debug!("Configuration loaded successfully.");
        Ok(config)
    }

    /// A configuration rooted at `root` with every other setting at its default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let kiln_root = root.into();
        let formula_paths = vec![kiln_root.join("Formula")];
        Self {
            kiln_root,
            cache_root: None,
            formula_paths,
            make_jobs: num_cpus::get().max(1),
            keep_build_dir: false,
            skip_test: false,
        }
    }

    pub fn kiln_root(&self) -> &Path {
        &self.kiln_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.kiln_root.join("bin")
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.kiln_root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.kiln_root.join("opt")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(|| self.kiln_root.join("kiln_cache"))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.kiln_root.join("kiln_logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.kiln_root.join("tmp")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    /// First existing `<dir>/<name>.json` or `<dir>/<name>.rb` across the formula paths.
    pub fn find_formula_file(&self, formula_name: &str) -> Option<PathBuf> {
        self.formula_paths.iter().find_map(|dir| {
            ["json", "rb"]
                .iter()
                .map(|ext| dir.join(format!("{formula_name}.{ext}")))
                .find(|p| p.is_file())
        })
    }
}

fn parse_jobs(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(KilnError::Config(format!(
            "KILN_MAKE_JOBS must be a positive integer, got '{value}'"
        ))),
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_prefix_layout() {
        let config = Config::with_root("/tmp/kiln-root");
        assert_eq!(
            config.formula_keg_path("qvm-ffmpeg", "0.0.0-test2-g"),
            PathBuf::from("/tmp/kiln-root/Cellar/qvm-ffmpeg/0.0.0-test2-g")
        );
        assert_eq!(
            config.formula_opt_path("cmake"),
            PathBuf::from("/tmp/kiln-root/opt/cmake")
        );
        assert_eq!(
            config.downloads_dir(),
            PathBuf::from("/tmp/kiln-root/kiln_cache/downloads")
        );
        assert_eq!(config.formula_paths, vec![PathBuf::from("/tmp/kiln-root/Formula")]);
    }

    #[test]
    fn cache_override_moves_downloads() {
        let mut config = Config::with_root("/tmp/kiln-root");
        config.cache_root = Some(PathBuf::from("/var/cache/kiln"));
        assert_eq!(config.downloads_dir(), PathBuf::from("/var/cache/kiln/downloads"));
    }

    #[test]
    fn job_count_must_be_positive() {
        assert_eq!(parse_jobs(" 8 ").unwrap(), 8);
        assert!(matches!(parse_jobs("0"), Err(KilnError::Config(_))));
        assert!(parse_jobs("many").is_err());
    }

    #[test]
    fn finds_formula_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qvm-ffmpeg.rb"), "class QvmFfmpeg < Formula\nend\n").unwrap();
        let mut config = Config::with_root(dir.path());
        config.formula_paths = vec![dir.path().to_path_buf()];
        assert_eq!(
            config.find_formula_file("qvm-ffmpeg"),
            Some(dir.path().join("qvm-ffmpeg.rb"))
        );
        assert!(config.find_formula_file("cmake").is_none());
    }
}
