// kiln-core/src/build/steps.rs
// Template expansion for install steps, the self-test and caveats.

use std::path::{Path, PathBuf};

use kiln_common::model::formula::STD_CMAKE_ARGS_TOKEN;

use super::args::StdBuildArgs;

/// Locations a formula's commands may refer to through `{token}`s.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub prefix: PathBuf,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub jobs: usize,
}

impl StepContext {
    pub fn new(keg_path: &Path, source_dir: &Path, jobs: usize) -> Self {
        Self {
            prefix: keg_path.to_path_buf(),
            source_dir: source_dir.to_path_buf(),
            build_dir: source_dir.join("build"),
            jobs: jobs.max(1),
        }
    }

    fn lookup(&self, token: &str) -> Option<String> {
        let path = match token {
            "prefix" => self.prefix.clone(),
            "bin" => self.prefix.join("bin"),
            "lib" => self.prefix.join("lib"),
            "share" => self.prefix.join("share"),
            "include" => self.prefix.join("include"),
            "etc" => self.prefix.join("etc"),
            "source_dir" => self.source_dir.clone(),
            "build_dir" => self.build_dir.clone(),
            "jobs" => return Some(self.jobs.to_string()),
            _ => return None,
        };
        Some(path.display().to_string())
    }

    /// Replaces every known `{token}` in `text`. Unknown tokens stay as written.
    pub fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open..];
            match after.find('}') {
                Some(close) => {
                    let token = &after[1..close];
                    match self.lookup(token) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&after[..=close]),
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(after);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Expands a full command line. A standalone `{std_cmake_args}` becomes
    /// the whole standard argument list.
    pub fn expand_command(&self, command: &[String], std_args: &StdBuildArgs) -> Vec<String> {
        let mut out = Vec::with_capacity(command.len());
        for arg in command {
            if arg == STD_CMAKE_ARGS_TOKEN {
                out.extend(std_args.cmake_args());
            } else {
                out.push(self.expand(arg));
            }
        }
        out
    }

    pub fn render_caveats(&self, caveats: &str) -> String {
        self.expand(caveats.trim_end())
    }
}
