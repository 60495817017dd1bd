//! Serialized execution of the hypervisor control-plane CLI.
//!
//! `VBoxManage` is not safe to invoke concurrently: overlapping calls
//! corrupt its registry. All invocations therefore funnel through a
//! single-worker FIFO queue; tasks run strictly in arrival order and each
//! task's captured output goes only to its own caller.
//!
//! A non-zero exit code is data, not an error: callers decide whether it
//! is fatal (an unregister of a machine that never existed is expected; a
//! failed clone is not).

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Captured result of one control-plane invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Captured stdout.
    pub stdout: String,

    /// Process exit code (`-1` when terminated by a signal).
    pub code: i32,
}

impl CommandOutput {
    /// Whether the invocation exited zero.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

struct CommandTask {
    args: Vec<String>,
    reply: oneshot::Sender<Result<CommandOutput>>,
}

/// Handle to the single-worker command queue.
///
/// Clones share the same queue; dropping every clone stops the worker.
#[derive(Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    tx: mpsc::UnboundedSender<CommandTask>,
}

impl CommandExecutor {
    /// Create an executor for `program` and start its worker task.
    pub fn new(program: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_worker(program.clone(), rx));

        Self { program, tx }
    }

    /// The control-plane executable this queue drives.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Enqueue an invocation and wait for its captured output.
    pub async fn execute(&self, args: &[&str]) -> Result<CommandOutput> {
        let (reply, response) = oneshot::channel();
        let task = CommandTask {
            args: args.iter().map(|a| a.to_string()).collect(),
            reply,
        };

        self.tx
            .send(task)
            .map_err(|_| Error::communication("command queue worker has stopped"))?;

        response
            .await
            .map_err(|_| Error::communication("command queue worker dropped the task"))?
    }

    /// Start a long-lived process without waiting for it to exit.
    ///
    /// Readiness of whatever the process brings up is discovered through
    /// `status` polling, never through process exit.
    pub fn spawn_detached(&self, args: &[&str]) -> Result<()> {
        debug!(program = %self.program.display(), args = ?args, "spawn detached");

        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(())
    }
}

async fn run_worker(program: PathBuf, mut rx: mpsc::UnboundedReceiver<CommandTask>) {
    while let Some(task) = rx.recv().await {
        let result = run_one(&program, &task.args).await;

        if task.reply.send(result).is_err() {
            warn!(program = %program.display(), "caller went away before command finished");
        }
    }
}

async fn run_one(program: &PathBuf, args: &[String]) -> Result<CommandOutput> {
    debug!(program = %program.display(), args = ?args, "exec");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let code = output.status.code().unwrap_or(-1);

    // Mirror captured streams to the diagnostic log at high verbosity.
    if !stdout.is_empty() {
        trace!(output = %stdout.trim_end(), "exec stdout");
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        trace!(output = %stderr.trim_end(), "exec stderr");
    }

    Ok(CommandOutput { stdout, code })
}
