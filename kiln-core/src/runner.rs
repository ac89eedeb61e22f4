// kiln-core/src/runner.rs
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use kiln_aio::process::run_command_async;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::BuildPhase;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Step(BuildPhase),
    SelfTest,
}

/// One fully expanded external command.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub kind: InvocationKind,
}

impl CommandInvocation {
    /// Splits an expanded command line into program and arguments.
    pub fn from_command(
        command: Vec<String>,
        cwd: &Path,
        env: &HashMap<String, String>,
        kind: InvocationKind,
    ) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| KilnError::CommandExec("empty command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            cwd: cwd.to_path_buf(),
            env: env.clone(),
            kind,
        })
    }
}

impl fmt::Display for CommandInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external build-system and self-test commands. A non-zero exit is a
/// normal `CommandOutput`; only failing to start the process is an error.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: &CommandInvocation,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Spawns commands with `tokio::process`, resolving bare program names on the
/// invocation's own PATH.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    fn resolve_program(invocation: &CommandInvocation) -> Result<PathBuf> {
        let program = Path::new(&invocation.program);
        if program.components().count() > 1 {
            return Ok(if program.is_absolute() {
                program.to_path_buf()
            } else {
                invocation.cwd.join(program)
            });
        }
        let search_path = invocation.env.get("PATH").cloned().unwrap_or_default();
        which::which_in(&invocation.program, Some(search_path), &invocation.cwd).map_err(|e| {
            KilnError::CommandExec(format!(
                "'{}' not found on the build PATH: {e}",
                invocation.program
            ))
        })
    }
}

impl CommandRunner for TokioCommandRunner {
    fn run(
        &self,
        invocation: &CommandInvocation,
    ) -> impl Future<Output = Result<CommandOutput>> + Send {
        async move {
            let program = Self::resolve_program(invocation)?;
            debug!("Resolved {} to {}", invocation.program, program.display());
            let output = run_command_async(
                &program,
                &invocation.args,
                Some(&invocation.cwd),
                Some(&invocation.env),
            )
            .await?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}
