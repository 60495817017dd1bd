//! Provision execution: applying a merged overlay to a ready node.
//!
//! The overlay's `bootstrap` list is a sequence of shell commands run in
//! order over ssh. A failed command aborts the sequence; commands must
//! be written to tolerate re-runs because provisioning is retried as a
//! whole.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::provider::ShellSpec;
use crate::shell;

/// Applies a merged provisioning overlay to a node.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        node: &str,
        overlay: &Value,
        spec: &ShellSpec,
        dry: bool,
    ) -> Result<()>;
}

/// Extract the ordered command list from a merged overlay.
pub fn bootstrap_commands(node: &str, overlay: &Value) -> Result<Vec<String>> {
    let Some(raw) = overlay.get("bootstrap") else {
        return Ok(Vec::new());
    };

    let list = raw.as_array().ok_or_else(|| {
        Error::user(format!("\"bootstrap\" for node {node:?} is not a list"))
    })?;

    list.iter()
        .map(|entry| {
            entry.as_str().map(str::to_string).ok_or_else(|| {
                Error::user(format!(
                    "\"bootstrap\" for node {node:?} contains a non-string command"
                ))
            })
        })
        .collect()
}

/// Runs overlay commands one at a time over ssh.
pub struct SshProvisioner;

#[async_trait]
impl Provisioner for SshProvisioner {
    async fn provision(
        &self,
        node: &str,
        overlay: &Value,
        spec: &ShellSpec,
        dry: bool,
    ) -> Result<()> {
        let commands = bootstrap_commands(node, overlay)?;

        for command in &commands {
            info!(node = %node, command = %command, dry = dry, "provision step");
            if dry {
                continue;
            }

            let code = shell::run_command(spec, command).await?;
            if code != 0 {
                return Err(Error::user(format!(
                    "provisioning of node {node:?} failed at {command:?} (exit code {code})"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_commands_in_order() {
        let overlay = json!({"bootstrap": ["a", "b", "c"]});
        assert_eq!(
            bootstrap_commands("web1", &overlay).unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn missing_bootstrap_means_nothing_to_run() {
        assert!(bootstrap_commands("web1", &json!({})).unwrap().is_empty());
    }

    #[test]
    fn non_string_commands_are_rejected() {
        let overlay = json!({"bootstrap": ["a", 7]});
        let err = bootstrap_commands("web1", &overlay).unwrap_err();
        assert!(err.is_user());
    }
}
