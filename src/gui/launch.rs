//! Program launch inside the agent's desktop session
//!
//! Starts a process and returns its PID; when asked to wait, also the exit
//! code and captured output. Shell mode routes the command line through the
//! platform shell so operators can use builtins and redirection.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::GuiError;

/// Launch request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Wait for exit and capture output
    #[serde(default)]
    pub wait: bool,
    /// Run through the platform shell
    #[serde(default)]
    pub shell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Launch result returned in the envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchResult {
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Starts a program per the request
///
/// # Errors
///
/// Returns `GuiError::Launch` when the process cannot be spawned.
pub async fn execute_program(request: &LaunchRequest) -> Result<LaunchResult, GuiError> {
    let mut command = if request.shell {
        let mut line = request.path.clone();
        for arg in &request.args {
            line.push(' ');
            line.push_str(arg);
        }
        shell_command(&line)
    } else {
        let mut command = tokio::process::Command::new(&request.path);
        command.args(&request.args);
        command
    };
    if let Some(dir) = &request.working_dir {
        command.current_dir(dir);
    }

    info!(path = %request.path, wait = request.wait, shell = request.shell, "launching program");

    if request.wait {
        let child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id();
        let output = child.wait_with_output().await?;
        Ok(LaunchResult {
            pid,
            exit_code: output.status.code(),
            stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
        })
    } else {
        let child = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(LaunchResult {
            pid: child.id(),
            exit_code: None,
            stdout: None,
            stderr: None,
        })
    }
}

#[cfg(windows)]
fn shell_command(line: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiting_launch_captures_exit_code_and_output() {
        let request = LaunchRequest {
            path: "echo".to_string(),
            args: vec!["launch-probe".to_string()],
            wait: true,
            shell: true,
            working_dir: None,
        };
        let result = execute_program(&request).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.unwrap().contains("launch-probe"));
    }

    #[tokio::test]
    async fn fire_and_forget_returns_a_pid_only() {
        let request = LaunchRequest {
            path: "sleep".to_string(),
            args: vec!["0".to_string()],
            wait: false,
            shell: false,
            working_dir: None,
        };
        let result = execute_program(&request).await.unwrap();
        assert!(result.pid.is_some());
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let request = LaunchRequest {
            path: "/definitely/not/a/binary".to_string(),
            args: Vec::new(),
            wait: false,
            shell: false,
            working_dir: None,
        };
        assert!(matches!(
            execute_program(&request).await,
            Err(GuiError::Launch { .. })
        ));
    }
}
