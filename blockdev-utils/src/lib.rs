// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around Linux block-layer commands.

pub mod blockinfo;
pub mod devlinks;
pub mod ext4;
pub mod mount;

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

fn command_to_string(command: &std::process::Command) -> String {
    let mut parts =
        vec![command.get_program().to_string_lossy().to_string()];
    parts.extend(
        command.get_args().map(|s| s.to_string_lossy().to_string()),
    );
    parts.join(" ")
}

pub fn output_to_exec_error(
    command: &std::process::Command,
    output: &std::process::Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Runs `command` to completion, mapping a failure to spawn or a non-zero
/// exit status into an [`ExecutionError`] carrying the full command line.
pub async fn execute_async(
    command: &mut tokio::process::Command,
) -> Result<std::process::Output, ExecutionError> {
    let output = command.output().await.map_err(|err| {
        ExecutionError::ExecutionStart {
            command: command_to_string(command.as_std()),
            err,
        }
    })?;

    if !output.status.success() {
        return Err(output_to_exec_error(command.as_std(), &output));
    }

    Ok(output)
}
