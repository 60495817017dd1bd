//! Ssh session handling.
//!
//! Sessions go through the system `ssh` binary with stdio inherited, so
//! interactive shells and password prompts behave exactly as a manual
//! invocation would. Authentication material never appears on the
//! command line beyond a key path.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::provider::{Auth, ShellSpec};

/// Build the `ssh` argument vector for a connection descriptor.
pub fn ssh_args(spec: &ShellSpec) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        spec.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
    ];

    if let Auth::Key { path, .. } = &spec.auth {
        args.push("-i".to_string());
        args.push(path.clone());
    }

    args.push(format!("{}@{}", spec.username, spec.host));
    args
}

async fn run(spec: &ShellSpec, command: Option<&str>) -> Result<i32> {
    let mut args = ssh_args(spec);
    if let Some(command) = command {
        args.push(command.to_string());
    }

    debug!(target = %spec, command = ?command, "ssh");

    let status = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| Error::communication(format!("cannot run ssh ({e})")))?;

    Ok(status.code().unwrap_or(-1))
}

/// Open an interactive shell on the node. Returns the session exit code.
pub async fn interactive(spec: &ShellSpec) -> Result<i32> {
    run(spec, None).await
}

/// Run one command on the node, streaming its output to the terminal.
pub async fn run_command(spec: &ShellSpec, command: &str) -> Result<i32> {
    run(spec, Some(command)).await
}
