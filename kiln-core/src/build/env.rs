// kiln-core/src/build/env.rs
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use tracing::debug;

// Variables passed through from the user's environment. Everything else is
// dropped; PATH is rebuilt from scratch.
const ENV_VARS_TO_KEEP: &[&str] = &[
    "HOME", "USER", "LOGNAME", "LANG", "TERM", "SHELL", "TMPDIR", "TZ",
];

const SYSTEM_PATH_DIRS: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// The sanitized environment every install step and self-test runs with.
#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    vars: HashMap<String, String>,
    path_dirs: Vec<PathBuf>,
}

impl BuildEnvironment {
    /// Builds the environment from the current process environment.
    pub fn new(kiln_prefix: &Path, dep_opt_paths: &[PathBuf], jobs: usize) -> Result<Self> {
        Self::from_vars(env::vars(), kiln_prefix, dep_opt_paths, jobs)
    }

    pub fn from_vars(
        initial_env: impl IntoIterator<Item = (String, String)>,
        kiln_prefix: &Path,
        dep_opt_paths: &[PathBuf],
        jobs: usize,
    ) -> Result<Self> {
        let mut vars: HashMap<String, String> = initial_env
            .into_iter()
            .filter(|(key, _)| ENV_VARS_TO_KEEP.contains(&key.as_str()) || key.starts_with("LC_"))
            .collect();
        debug!("Kept {} variables from the user environment", vars.len());

        let mut path_dirs: Vec<PathBuf> = Vec::new();
        for opt in dep_opt_paths {
            let bin = opt.join("bin");
            if bin.is_dir() && !path_dirs.contains(&bin) {
                debug!("Prepending dependency bin to PATH: {}", bin.display());
                path_dirs.push(bin);
            }
        }
        let kiln_bin = kiln_prefix.join("bin");
        if kiln_bin.is_dir() && !path_dirs.contains(&kiln_bin) {
            path_dirs.push(kiln_bin);
        }
        path_dirs.extend(SYSTEM_PATH_DIRS.iter().map(PathBuf::from));

        vars.insert("PATH".to_string(), join_paths(&path_dirs)?);

        if !dep_opt_paths.is_empty() {
            vars.insert("CMAKE_PREFIX_PATH".to_string(), join_paths(dep_opt_paths)?);
            let pkg_config_dirs: Vec<PathBuf> = dep_opt_paths
                .iter()
                .flat_map(|opt| [opt.join("lib/pkgconfig"), opt.join("share/pkgconfig")])
                .collect();
            vars.insert("PKG_CONFIG_PATH".to_string(), join_paths(&pkg_config_dirs)?);
        }

        let jobs = jobs.max(1);
        vars.insert("MAKEFLAGS".to_string(), format!("-j{jobs}"));
        vars.insert("CMAKE_BUILD_PARALLEL_LEVEL".to_string(), jobs.to_string());

        Ok(Self { vars, path_dirs })
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn path_dirs(&self) -> &[PathBuf] {
        &self.path_dirs
    }

    pub fn get_path_string(&self) -> &str {
        self.get("PATH").unwrap_or_default()
    }
}

fn join_paths(paths: &[PathBuf]) -> Result<String> {
    env::join_paths(paths)
        .map_err(|e| KilnError::Config(format!("Failed to join search path: {e}")))?
        .into_string()
        .map_err(|os| KilnError::Config(format!("Search path contains non-UTF8 characters: {os:?}")))
}
