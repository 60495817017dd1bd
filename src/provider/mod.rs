//! Provider abstraction: the fixed capability set every control plane
//! implements, the shared state vocabulary, and the singleton registry.
//!
//! State is never stored: every `status` call derives it fresh from the
//! control plane, and handles are re-derived rather than cached because
//! the backing resource may have been replaced between actions.

pub mod cloud;
pub mod virtualbox;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::Manifest;
use crate::error::{Error, Result};
use crate::poll::{self, POLL_INTERVAL};

pub use cloud::CloudProvider;
pub use virtualbox::VirtualBoxProvider;

pub const PROVIDER_VIRTUALBOX: &str = "virtualbox";
pub const PROVIDER_CLOUD: &str = "cloud";

/// Fallback provider kind when neither CLI, node, nor manifest name one.
pub const DEFAULT_PROVIDER: &str = PROVIDER_VIRTUALBOX;

/// Username used when a node configures none.
pub const DEFAULT_USERNAME: &str = "armada";

/// Default ssh port when a node configures none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Lifecycle state of a node, derived fresh on every `status` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Booting,
    Running,
    Halting,
    /// Suspended-to-disk; local VMs only.
    Paused,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Stopped => "stopped",
            NodeState::Booting => "booting",
            NodeState::Running => "running",
            NodeState::Halting => "halting",
            NodeState::Paused => "paused",
        };
        write!(f, "{label}")
    }
}

/// Result of a `status` call.
///
/// `address` is only ever present when the state is `Running`; `handle`
/// is the provider's opaque identifier for the live resource.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: NodeState,
    pub address: Option<String>,
    pub handle: Option<String>,
}

impl NodeStatus {
    pub fn stopped() -> Self {
        Self {
            state: NodeState::Stopped,
            address: None,
            handle: None,
        }
    }
}

/// Shell credential material.
#[derive(Debug, Clone)]
pub enum Auth {
    Password(String),
    Key {
        path: String,
        passphrase: Option<String>,
    },
}

/// Normalized ssh connection descriptor for a ready node.
///
/// Computed on demand once the node is running and its ssh port has been
/// confirmed open; never persisted.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub username: String,
    pub auth: Auth,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ShellSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh://{}@{}:{}", self.username, self.host, self.port)
    }
}

/// The capability set implemented by every provider kind.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider kind name, as used in manifests and the registry.
    fn name(&self) -> &str;

    /// Derive the node's current state from the control plane.
    ///
    /// "No such resource" is `Stopped`, not an error; only control-plane
    /// communication failures fail.
    async fn status(&self, node: &str) -> Result<NodeStatus>;

    /// Drive a stopped node to running, then re-derive status.
    async fn boot(&self, node: &str) -> Result<NodeStatus>;

    /// Tear a node down, then re-derive status.
    async fn halt(&self, node: &str) -> Result<NodeStatus>;

    /// Block until the node is running and its ssh port is reachable,
    /// then return the normalized connection descriptor.
    async fn shell_spec(&self, node: &str) -> Result<ShellSpec>;

    /// Compute the provider's pre-provisioning overlay for a node.
    ///
    /// Pure with respect to the node record: calling it twice yields the
    /// same overlay, so retried pipelines never duplicate commands.
    async fn bootstrap(&self, node: &str) -> Result<Value>;

    /// Suspend a running node to disk. Local VMs only.
    async fn pause(&self, node: &str) -> Result<NodeStatus> {
        Err(Error::user(format!(
            "provider {:?} does not support pausing node {node:?}",
            self.name()
        )))
    }

    /// Resume a paused node. Local VMs only.
    async fn resume(&self, node: &str) -> Result<NodeStatus> {
        Err(Error::user(format!(
            "provider {:?} does not support resuming node {node:?}",
            self.name()
        )))
    }
}

/// Credential and port parameters shared by every provider's
/// `shell_spec` implementation.
#[derive(Debug, Clone)]
pub(crate) struct ShellParams {
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub port: u16,
}

/// Extract and validate shell parameters from a node's parameter bag.
pub(crate) fn shell_params(manifest: &Manifest, node: &str, kind: &str) -> Result<ShellParams> {
    let password = manifest.string_property(node, kind, "password");
    let private_key = manifest.string_property(node, kind, "privateKey");

    if password.is_none() && private_key.is_none() {
        return Err(Error::user(format!(
            "no password or privateKey provided for node {node:?}"
        )));
    }

    let port = match manifest.property(node, kind, "sshPort") {
        None => DEFAULT_SSH_PORT,
        Some(value) => parse_port(value)
            .ok_or_else(|| Error::user(format!("ssh port for node {node:?} is incorrect")))?,
    };

    Ok(ShellParams {
        username: manifest
            .string_property(node, kind, "username")
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
        password,
        private_key,
        passphrase: manifest.string_property(node, kind, "passphrase"),
        port,
    })
}

fn parse_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };

    (1..=u64::from(u16::MAX)).contains(&port).then(|| port as u16)
}

/// The generic `shell_spec` flow: repeat `status` until the node is
/// running with an address (failing on terminal states), then block until
/// the ssh port confirms open, then build the spec.
pub(crate) async fn resolve_shell_spec<P: Provider + ?Sized>(
    provider: &P,
    node: &str,
    params: ShellParams,
    deadline: Option<Duration>,
) -> Result<ShellSpec> {
    let started = Instant::now();

    let address = loop {
        let status = provider.status(node).await?;

        match status.state {
            NodeState::Halting => {
                return Err(Error::user(format!("node {node:?} is halting")));
            }
            NodeState::Stopped => {
                return Err(Error::user(format!("node {node:?} is stopped")));
            }
            NodeState::Paused => {
                return Err(Error::user(format!("node {node:?} is paused")));
            }
            NodeState::Running => {
                if let Some(address) = status.address {
                    break address;
                }
            }
            NodeState::Booting => {}
        }

        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                return Err(Error::Timeout {
                    what: format!("node {node} to finish booting"),
                    after: limit,
                });
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    };

    let port = params.port;
    let remaining = deadline.map(|limit| limit.saturating_sub(started.elapsed()));

    let host = address.as_str();
    poll::wait_until(
        &format!("ssh port {port} on {host}"),
        POLL_INTERVAL,
        remaining,
        move || async move { Ok(poll::port_open(host, port).await) },
    )
    .await?;

    let auth = match (params.password, params.private_key) {
        (_, Some(path)) => Auth::Key {
            path,
            passphrase: params.passphrase,
        },
        (Some(password), None) => Auth::Password(password),
        (None, None) => unreachable!("validated in shell_params"),
    };

    Ok(ShellSpec {
        username: params.username,
        auth,
        host: address,
        port,
    })
}

/// Resolves provider singletons by case-folded name.
///
/// One instance per name per registry: providers own stateful queues
/// (command executor, import queue) that must not be duplicated per call.
/// The registry itself is owned by the engine, not by the process.
pub struct Registry {
    manifest: Arc<Manifest>,
    instances: std::sync::Mutex<HashMap<String, Arc<dyn Provider>>>,
}

impl Registry {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self {
            manifest,
            instances: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a provider by name, constructing it on first use.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let key = name.to_lowercase();
        let mut instances = self.instances.lock().expect("registry lock poisoned");

        if let Some(provider) = instances.get(&key) {
            return Ok(Arc::clone(provider));
        }

        let provider: Arc<dyn Provider> = match key.as_str() {
            PROVIDER_VIRTUALBOX => Arc::new(VirtualBoxProvider::new(Arc::clone(&self.manifest))),
            PROVIDER_CLOUD => Arc::new(CloudProvider::new(Arc::clone(&self.manifest))?),
            _ => return Err(Error::user(format!("provider {name:?} is not found"))),
        };

        instances.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    /// Pre-register a provider instance under a name. Used by tests to
    /// inject doubles.
    pub fn seed(&self, name: &str, provider: Arc<dyn Provider>) {
        self.instances
            .lock()
            .expect("registry lock poisoned")
            .insert(name.to_lowercase(), provider);
    }
}
