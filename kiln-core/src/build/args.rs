// kiln-core/src/build/args.rs
use std::path::{Path, PathBuf};

const DEFAULT_BUILD_TYPE: &str = "Release";

/// The standard CMake arguments for one keg. Built per install and handed to
/// the configure phase; nothing here reads process state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdBuildArgs {
    pub install_prefix: PathBuf,
    pub build_type: String,
    pub jobs: usize,
    pub extra_defines: Vec<(String, String)>,
}

impl StdBuildArgs {
    pub fn new(install_prefix: &Path, jobs: usize) -> Self {
        Self {
            install_prefix: install_prefix.to_path_buf(),
            build_type: DEFAULT_BUILD_TYPE.to_string(),
            jobs: jobs.max(1),
            extra_defines: Vec::new(),
        }
    }

    pub fn with_define(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_defines.push((key.into(), value.into()));
        self
    }

    /// Adds `CMAKE_PREFIX_PATH` for the given dependency prefixes. No-op when empty.
    pub fn with_prefix_path(self, prefixes: &[PathBuf]) -> Self {
        if prefixes.is_empty() {
            return self;
        }
        let joined = prefixes
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(";");
        self.with_define("CMAKE_PREFIX_PATH", joined)
    }

    pub fn cmake_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-DCMAKE_INSTALL_PREFIX={}", self.install_prefix.display()),
            "-DCMAKE_INSTALL_LIBDIR=lib".to_string(),
            format!("-DCMAKE_BUILD_TYPE={}", self.build_type),
            "-DCMAKE_FIND_FRAMEWORK=LAST".to_string(),
            "-DCMAKE_VERBOSE_MAKEFILE=ON".to_string(),
            "-Wno-dev".to_string(),
            "-DBUILD_TESTING=OFF".to_string(),
        ];
        args.extend(
            self.extra_defines
                .iter()
                .map(|(k, v)| format!("-D{k}={v}")),
        );
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_standard_arguments() {
        let keg = Path::new("/opt/kiln/Cellar/qvm-ffmpeg/0.0.0-test2-g");
        let args = StdBuildArgs::new(keg, 8).cmake_args();
        assert_eq!(
            args[0],
            "-DCMAKE_INSTALL_PREFIX=/opt/kiln/Cellar/qvm-ffmpeg/0.0.0-test2-g"
        );
        assert!(args.contains(&"-DCMAKE_BUILD_TYPE=Release".to_string()));
        assert!(args.contains(&"-DCMAKE_INSTALL_LIBDIR=lib".to_string()));
        assert!(args.contains(&"-DBUILD_TESTING=OFF".to_string()));
        assert!(args.contains(&"-DCMAKE_VERBOSE_MAKEFILE=ON".to_string()));
        assert_eq!(args.len(), 7);
    }

    #[test]
    fn extra_defines_follow_the_defaults() {
        let args = StdBuildArgs::new(Path::new("/k"), 0)
            .with_prefix_path(&[PathBuf::from("/opt/kiln/opt/ffmpeg"), PathBuf::from("/opt/kiln/opt/freetype")])
            .with_define("QVM_STATIC", "OFF")
            .cmake_args();
        assert_eq!(
            &args[7..],
            &[
                "-DCMAKE_PREFIX_PATH=/opt/kiln/opt/ffmpeg;/opt/kiln/opt/freetype".to_string(),
                "-DQVM_STATIC=OFF".to_string(),
            ]
        );
    }

    #[test]
    fn jobs_never_drop_below_one() {
        assert_eq!(StdBuildArgs::new(Path::new("/k"), 0).jobs, 1);
        assert!(StdBuildArgs::new(Path::new("/k"), 3)
            .with_prefix_path(&[])
            .extra_defines
            .is_empty());
    }
}
