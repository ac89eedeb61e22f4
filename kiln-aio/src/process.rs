// kiln-aio/src/process.rs
use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};

use kiln_common::error::{KilnError, Result};
use tokio::process::Command;
use tracing::{debug, error};

/// Runs an external command and captures its output. A non-zero exit is not
/// an error here; callers inspect `Output::status`. When `envs` is given the
/// child sees only those variables.
pub async fn run_command_async(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    envs: Option<&HashMap<String, String>>,
) -> Result<Output> {
    debug!(
        "Running command: {} {:?} (cwd: {:?}, env keys: {:?})",
        program.display(),
        args,
        cwd,
        envs.map(|e| e.keys().collect::<Vec<_>>())
    );

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.kill_on_drop(true);

    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    if let Some(env_map) = envs {
        cmd.env_clear();
        cmd.envs(env_map);
    }

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());

    match cmd.output().await {
        Ok(output) => {
            if output.status.success() {
                debug!("Command {} finished successfully.", program.display());
            } else {
                debug!(
                    "Command {} failed with status: {}",
                    program.display(),
                    output.status
                );
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    debug!("Stderr:\n{}", stderr.trim());
                }
            }
            Ok(output)
        }
        Err(e) => {
            error!("Failed to execute {}: {}", program.display(), e);
            Err(KilnError::CommandExec(format!("{}: {}", program.display(), e)))
        }
    }
}
