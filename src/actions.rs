//! The action set: every pipeline the engine can run against a node.
//!
//! Pipelines are compositions of provider capabilities. Within one node
//! the steps run strictly in order; the engine runs different nodes
//! concurrently.

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use colored::Colorize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Manifest;
use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::merge::merge_overlays;
use crate::poll::{self, BOOT_POLL_INTERVAL};
use crate::provider::{NodeState, NodeStatus, Provider, Registry, DEFAULT_PROVIDER};
use crate::provision::Provisioner;
use crate::shell;

/// Directory on every node where sibling addresses are published.
pub const NODES_DIR: &str = "/etc/armada/nodes/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Report each node's current state.
    Status,
    /// Create and start a stopped node.
    Boot,
    /// Tear a node down.
    Halt,
    /// Halt (best effort) and boot again.
    Reload,
    /// Apply the merged provisioning overlay to a running node.
    Provision,
    /// Open a shell (or run one command) on a running node.
    Shell,
    /// Boot if stopped, wait until ready, then provision.
    Up,
    /// Halt unless already stopped.
    Down,
    /// Suspend a running node.
    Pause,
    /// Resume a paused node.
    Resume,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Action::Status => "status",
            Action::Boot => "boot",
            Action::Halt => "halt",
            Action::Reload => "reload",
            Action::Provision => "provision",
            Action::Shell => "shell",
            Action::Up => "up",
            Action::Down => "down",
            Action::Pause => "pause",
            Action::Resume => "resume",
        };
        write!(f, "{label}")
    }
}

impl Action {
    /// Whether the action only makes sense against a single node.
    pub fn single_node(&self) -> bool {
        matches!(self, Action::Shell)
    }
}

/// Everything an action pipeline needs, shared across nodes of one run.
pub struct ActionContext {
    pub manifest: Arc<Manifest>,
    pub registry: Arc<Registry>,
    pub provisioner: Arc<dyn Provisioner>,
    pub options: Arc<EngineOptions>,
}

impl ActionContext {
    /// Resolve the provider for a node: CLI override first, then the
    /// node's declaration, then the manifest default.
    pub fn provider_for(&self, node: &str) -> Result<Arc<dyn Provider>> {
        let name = self
            .options
            .provider
            .as_deref()
            .or_else(|| self.manifest.node(node).ok().and_then(|n| n.provider.as_deref()))
            .or(self.manifest.provider.as_deref())
            .unwrap_or(DEFAULT_PROVIDER);

        self.registry.resolve(name)
    }

    /// Run one action pipeline against one node.
    pub async fn run(&self, action: Action, node: &str) -> Result<()> {
        let provider = self.provider_for(node)?;
        debug!(node = %node, action = %action, provider = %provider.name(), "pipeline start");

        match action {
            Action::Status => {
                report(node, &provider.status(node).await?);
            }
            Action::Boot => {
                report(node, &provider.boot(node).await?);
                self.provision_node(provider.as_ref(), node, false).await?;
            }
            Action::Halt => {
                report(node, &provider.halt(node).await?);
            }
            Action::Reload => {
                // A node that is already down should still boot.
                match provider.halt(node).await {
                    Ok(status) => report(node, &status),
                    Err(err) => info!(node = %node, error = %err, "halt skipped"),
                }
                report(node, &provider.boot(node).await?);
                self.provision_node(provider.as_ref(), node, false).await?;
            }
            Action::Provision => {
                self.provision_node(provider.as_ref(), node, true).await?;
            }
            Action::Shell => {
                self.shell(provider.as_ref(), node).await?;
            }
            Action::Up => {
                let status = provider.status(node).await?;
                if status.state != NodeState::Stopped {
                    report(node, &status);
                    return Ok(());
                }

                report(node, &provider.boot(node).await?);
                self.wait_ready(provider.as_ref(), node).await?;
                self.provision_node(provider.as_ref(), node, false).await?;
            }
            Action::Down => {
                let status = provider.status(node).await?;
                if status.state == NodeState::Stopped {
                    report(node, &status);
                    return Ok(());
                }
                report(node, &provider.halt(node).await?);
            }
            Action::Pause => {
                report(node, &provider.pause(node).await?);
            }
            Action::Resume => {
                report(node, &provider.resume(node).await?);
            }
        }

        Ok(())
    }

    /// Block until a booted node reports running with an address.
    async fn wait_ready(&self, provider: &dyn Provider, node: &str) -> Result<()> {
        let deadline = self
            .manifest
            .readiness_timeout_secs
            .map(std::time::Duration::from_secs);

        poll::wait_until(
            &format!("node {node} to finish booting"),
            BOOT_POLL_INTERVAL,
            deadline,
            move || async move {
                let status = provider.status(node).await?;
                Ok(status.state == NodeState::Running && status.address.is_some())
            },
        )
        .await
    }

    /// The provision pipeline: provider overlay, configured overlays,
    /// sibling address publication, then command execution over ssh.
    ///
    /// When invoked implicitly after a boot, a node without any
    /// provisioning configuration is left as-is; the explicit action
    /// treats that as a mistake.
    async fn provision_node(
        &self,
        provider: &dyn Provider,
        node: &str,
        explicit: bool,
    ) -> Result<()> {
        let node_cfg = self.manifest.node(node)?;

        let provider_layer = self
            .manifest
            .property(node, provider.name(), "provision")
            .cloned();

        if provider_layer.is_none()
            && node_cfg.provision.is_none()
            && self.manifest.provision.is_none()
        {
            if explicit {
                return Err(Error::user(format!(
                    "no provisioning configuration defined for node {node:?}"
                )));
            }
            debug!(node = %node, "no provisioning configuration, skipping");
            return Ok(());
        }

        let bootstrap = provider.bootstrap(node).await?;

        let mut layers: Vec<&Value> = vec![&bootstrap];
        layers.extend(provider_layer.as_ref());
        layers.extend(node_cfg.provision.as_ref());
        layers.extend(self.manifest.provision.as_ref());

        let mut merged = merge_overlays(layers).unwrap_or(Value::Null);

        let spec = provider.shell_spec(node).await?;

        // Collected only once this node is reachable, so siblings that
        // finished booting during the wait are included.
        self.publish_siblings(node, &mut merged).await?;

        info!(node = %node, target = %spec, "provisioning");

        self.provisioner
            .provision(node, &merged, &spec, self.options.dry)
            .await
    }

    /// Prepend commands that record every running sibling's address
    /// under `/etc/armada/nodes/` on the node being provisioned.
    async fn publish_siblings(&self, node: &str, overlay: &mut Value) -> Result<()> {
        let mut published = Vec::new();

        for sibling in self.manifest.nodes.keys() {
            if sibling == node {
                continue;
            }

            let provider = self.provider_for(sibling)?;
            match provider.status(sibling).await {
                Ok(status) => {
                    if let Some(address) = status.address {
                        published.push(format!(
                            "echo {address} | sudo tee {NODES_DIR}{sibling}"
                        ));
                    } else {
                        debug!(sibling = %sibling, state = %status.state, "sibling not published");
                    }
                }
                Err(err) => {
                    warn!(sibling = %sibling, error = %err, "cannot resolve sibling status");
                }
            }
        }

        if published.is_empty() {
            return Ok(());
        }

        let existing = overlay
            .get("bootstrap")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut commands = vec![Value::String(format!("sudo mkdir -p {NODES_DIR}"))];
        commands.extend(published.into_iter().map(Value::String));
        commands.extend(existing);

        if !overlay.is_object() {
            *overlay = Value::Object(serde_json::Map::new());
        }
        overlay["bootstrap"] = Value::Array(commands);

        Ok(())
    }

    async fn shell(&self, provider: &dyn Provider, node: &str) -> Result<()> {
        let spec = provider.shell_spec(node).await?;

        match self.options.command.as_deref() {
            Some(command) => {
                let code = shell::run_command(&spec, command).await?;
                if code != 0 {
                    return Err(Error::user(format!(
                        "command exited with code {code} on node {node:?}"
                    )));
                }
                Ok(())
            }
            None => {
                let code = shell::interactive(&spec).await?;
                debug!(node = %node, code = code, "shell session closed");
                Ok(())
            }
        }
    }
}

/// Print one node's status line.
fn report(node: &str, status: &NodeStatus) {
    let state = match status.state {
        NodeState::Running => status.state.to_string().green(),
        NodeState::Stopped => status.state.to_string().red(),
        NodeState::Paused => status.state.to_string().yellow(),
        _ => status.state.to_string().yellow(),
    };

    match &status.address {
        Some(address) => println!("{}: {} ({})", node.bold(), state, address),
        None => println!("{}: {}", node.bold(), state),
    }
}
