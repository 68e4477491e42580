use std::process::Command;

use tracing::debug;

use crate::error::{HostError, Result};

pub fn describe_command(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    let args: Vec<String> = cmd
        .get_args()
        .map(|a| a.to_string_lossy().to_string())
        .collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Runs `cmd`, fails on a non-zero exit, and returns captured stdout.
pub fn command_output(cmd: &mut Command) -> Result<String> {
    let line = describe_command(cmd);
    debug!(command = %line, "run");
    let output = cmd
        .output()
        .map_err(|e| HostError::Spawn(format!("{}: {}", line, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(HostError::CommandFailed(format!(
            "{} failed with exit code {}: {}",
            line,
            output.status.code().unwrap_or(1),
            stderr
        ))
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Like [`command_output`] but only cares about success.
pub fn run_checked(cmd: &mut Command) -> Result<()> {
    command_output(cmd).map(|_| ())
}
