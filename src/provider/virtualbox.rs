//! Local VirtualBox provider.
//!
//! Drives `VBoxManage` through the serialized command queue. A node's VM
//! is always a clone of a locally registered template, created at boot
//! and unregistered at halt, so node lifecycles never mutate the template
//! itself. State is parsed out of the CLI's free-text output on every
//! `status` call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::Manifest;
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use crate::import::ImportQueue;

use super::{
    resolve_shell_spec, shell_params, NodeState, NodeStatus, Provider, ShellSpec,
    PROVIDER_VIRTUALBOX,
};

/// Host-only interface every node's first NIC attaches to.
const HOSTONLY_IFACE: &str = "vboxnet0";
const HOSTONLY_IP: &str = "10.100.100.1";
const HOSTONLY_NETMASK: &str = "255.255.255.0";
const HOSTONLY_DHCP_IP: &str = "10.100.100.100";
const HOSTONLY_DHCP_LOWER: &str = "10.100.100.101";
const HOSTONLY_DHCP_UPPER: &str = "10.100.100.254";

/// Internal network shared by all nodes of a configuration.
const INTERNAL_NET: &str = "armada";
const INTERNAL_DHCP_IP: &str = "10.200.200.100";
const INTERNAL_DHCP_LOWER: &str = "10.200.200.101";
const INTERNAL_DHCP_UPPER: &str = "10.200.200.254";

/// Locate the `VBoxManage` executable for this platform.
pub fn locate_vboxmanage() -> PathBuf {
    if cfg!(target_os = "windows") {
        if let Ok(install_path) = std::env::var("VBOX_INSTALL_PATH") {
            for dir in std::env::split_paths(&install_path) {
                let candidate = dir.join("VBoxManage.exe");
                if candidate.exists() {
                    return candidate;
                }
            }
        }
        return PathBuf::from("VBoxManage.exe");
    }

    if cfg!(target_os = "macos") {
        let bundled = PathBuf::from("/Applications/VirtualBox.app/Contents/MacOS/VBoxManage");
        if bundled.exists() {
            return bundled;
        }
    }

    PathBuf::from("VBoxManage")
}

pub struct VirtualBoxProvider {
    manifest: Arc<Manifest>,
    executor: CommandExecutor,
    imports: ImportQueue,
    deadline: Option<Duration>,
}

impl VirtualBoxProvider {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        let program = manifest
            .bag(PROVIDER_VIRTUALBOX)
            .and_then(|bag| bag.get("executionPath"))
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(locate_vboxmanage);

        let executor = CommandExecutor::new(program);
        let imports = ImportQueue::new(executor.clone(), manifest.base_dir().to_path_buf());
        let deadline = manifest.readiness_timeout_secs.map(Duration::from_secs);

        Self {
            manifest,
            executor,
            imports,
            deadline,
        }
    }

    /// External VM name for a node, scoped by namespace when one is set.
    fn handle(&self, node: &str) -> String {
        match self.manifest.namespace_for(node) {
            Some(ns) => format!("{ns}:{node}"),
            None => node.to_string(),
        }
    }

    fn vm_id(&self, node: &str) -> Option<String> {
        self.manifest.string_property(node, PROVIDER_VIRTUALBOX, "vmId")
    }

    fn vm_url(&self, node: &str) -> Option<String> {
        self.manifest.string_property(node, PROVIDER_VIRTUALBOX, "vmUrl")
    }

    fn require_state(
        &self,
        node: &str,
        status: &NodeStatus,
        wanted: NodeState,
    ) -> Result<()> {
        if status.state == wanted {
            return Ok(());
        }

        Err(Error::user(match status.state {
            NodeState::Booting => format!("node {node:?} is already booting"),
            NodeState::Running => format!("node {node:?} is already running"),
            NodeState::Halting => format!("node {node:?} is halting"),
            NodeState::Paused => format!("node {node:?} is paused"),
            NodeState::Stopped => format!("node {node:?} is stopped"),
        }))
    }

    /// Best-effort reconfiguration of the shared host-only and internal
    /// networks. The commands fail when the resources already exist, so
    /// failures here are diagnostic only.
    async fn rewire(&self) -> Result<()> {
        let attempts: [&[&str]; 4] = [
            &[
                "hostonlyif", "ipconfig", HOSTONLY_IFACE, "--ip", HOSTONLY_IP, "--netmask",
                HOSTONLY_NETMASK,
            ],
            &[
                "dhcpserver", "modify", "--ifname", HOSTONLY_IFACE, "--ip", HOSTONLY_DHCP_IP,
                "--netmask", HOSTONLY_NETMASK, "--lowerip", HOSTONLY_DHCP_LOWER, "--upperip",
                HOSTONLY_DHCP_UPPER, "--enable",
            ],
            &[
                "dhcpserver", "add", "--netname", INTERNAL_NET, "--ip", INTERNAL_DHCP_IP,
                "--netmask", HOSTONLY_NETMASK, "--lowerip", INTERNAL_DHCP_LOWER, "--upperip",
                INTERNAL_DHCP_UPPER, "--enable",
            ],
            &[
                "dhcpserver", "modify", "--netname", INTERNAL_NET, "--ip", INTERNAL_DHCP_IP,
                "--netmask", HOSTONLY_NETMASK, "--lowerip", INTERNAL_DHCP_LOWER, "--upperip",
                INTERNAL_DHCP_UPPER, "--enable",
            ],
        ];

        for args in attempts {
            let output = self.executor.execute(args).await?;
            if !output.success() {
                debug!(args = ?args, code = output.code, "network setup attempt not applied");
            }
        }

        Ok(())
    }

    /// Ensure the node's template is registered locally, importing it
    /// from the configured source URL when absent.
    async fn ensure_template(&self, node: &str, vm_id: &str) -> Result<()> {
        let probe = self.executor.execute(&["showvminfo", vm_id]).await?;
        if probe.success() {
            return Ok(());
        }

        info!(node = %node, vm_id = %vm_id, "template not registered locally");

        let vm_url = self.vm_url(node).ok_or_else(|| {
            Error::user(format!(
                "no virtualbox \"vmUrl\" parameter specified for node {node:?}"
            ))
        })?;

        self.imports.import(&vm_url, vm_id).await
    }

    /// Resolve and validate the node's exposed directories.
    fn exposures(&self, node: &str) -> Result<Vec<(PathBuf, String)>> {
        let node_cfg = self.manifest.node(node)?;
        let mut shares = Vec::with_capacity(node_cfg.expose.len());

        for (src, dst) in &node_cfg.expose {
            let source = self.manifest.resolve_path(src);
            let metadata = std::fs::metadata(&source).map_err(|_| {
                Error::user(format!("cannot expose {src:?} because it does not exist"))
            })?;

            if !metadata.is_dir() {
                return Err(Error::user(format!(
                    "cannot expose {src:?} because it is not a directory"
                )));
            }

            shares.push((source, dst.clone()));
        }

        Ok(shares)
    }
}

#[async_trait]
impl Provider for VirtualBoxProvider {
    fn name(&self) -> &str {
        PROVIDER_VIRTUALBOX
    }

    async fn status(&self, node: &str) -> Result<NodeStatus> {
        self.manifest.node(node)?;
        let handle = self.handle(node);

        let described = self.executor.execute(&["showvminfo", &handle]).await?;
        if !described.success() {
            // No registration under this handle means the node is stopped.
            return Ok(NodeStatus::stopped());
        }

        let info = parse_vm_info(&described.stdout, node)?;
        let mut state = map_raw_state(&info.raw_state)
            .ok_or_else(|| Error::consistency(format!("undefined state for node {node:?}")))?;

        debug!(node = %node, vm = %info.name, uuid = %info.uuid, state = %state, "preliminary state");

        let enumerated = self
            .executor
            .execute(&["guestproperty", "enumerate", &handle])
            .await?;
        if !enumerated.success() {
            return Err(Error::consistency(format!(
                "cannot enumerate guest properties of {handle:?}"
            )));
        }

        let ifaces = parse_guest_net(&enumerated.stdout);
        let mut address = select_hostonly_address(&ifaces, &info.nics);

        // A running VM without an address is not externally usable yet.
        if address.is_none() && state == NodeState::Running {
            state = NodeState::Booting;
        }
        if state != NodeState::Running {
            address = None;
        }

        Ok(NodeStatus {
            state,
            address,
            handle: Some(info.uuid),
        })
    }

    async fn boot(&self, node: &str) -> Result<NodeStatus> {
        debug!(node = %node, "boot");

        let status = self.status(node).await?;
        self.require_state(node, &status, NodeState::Stopped)?;

        let handle = self.handle(node);

        // Clean slate: a stale registration under this handle is removed
        // speculatively; it usually does not exist.
        let unregistered = self
            .executor
            .execute(&["unregistervm", &handle, "--delete"])
            .await?;
        if !unregistered.success() {
            debug!(node = %node, handle = %handle, "no stale registration to remove");
        }

        let vm_id = self.vm_id(node).ok_or_else(|| {
            Error::user(format!(
                "no virtualbox \"vmId\" parameter specified for node {node:?}"
            ))
        })?;

        self.ensure_template(node, &vm_id).await?;

        let cloned = self
            .executor
            .execute(&["clonevm", &vm_id, "--name", &handle, "--register"])
            .await?;
        if !cloned.success() {
            return Err(Error::consistency(format!(
                "cannot clone {vm_id:?} into {handle:?}"
            )));
        }

        self.rewire().await?;

        let wired = self
            .executor
            .execute(&[
                "modifyvm", &handle, "--nic1", "hostonly", "--hostonlyadapter1", HOSTONLY_IFACE,
                "--nic2", "intnet", "--intnet2", INTERNAL_NET, "--nic3", "nat",
            ])
            .await?;
        if !wired.success() {
            return Err(Error::consistency(format!(
                "cannot attach network adaptors to {handle:?}"
            )));
        }

        for (source, dst) in self.exposures(node)? {
            let share = share_handle(&dst);
            let source_str = source.to_string_lossy();
            let shared = self
                .executor
                .execute(&[
                    "sharedfolder", "add", &handle, "--name", &share, "--hostpath", &source_str,
                ])
                .await?;
            if !shared.success() {
                return Err(Error::consistency(format!(
                    "cannot share {source_str:?} with {handle:?}"
                )));
            }
        }

        self.executor
            .spawn_detached(&["startvm", &handle, "--type", "headless"])?;

        self.status(node).await
    }

    async fn halt(&self, node: &str) -> Result<NodeStatus> {
        debug!(node = %node, "halt");

        let status = self.status(node).await?;
        match status.state {
            NodeState::Halting => {
                return Err(Error::user(format!("node {node:?} is already halting")))
            }
            NodeState::Stopped => {
                return Err(Error::user(format!("node {node:?} is already stopped")))
            }
            _ => {}
        }

        let handle = self.handle(node);

        // Power-off may fail for an already-dead VM; unregister anyway.
        let powered_off = self
            .executor
            .execute(&["controlvm", &handle, "poweroff"])
            .await?;
        if !powered_off.success() {
            debug!(node = %node, handle = %handle, "cannot power off, unregistering anyway");
        }

        let unregistered = self
            .executor
            .execute(&["unregistervm", &handle, "--delete"])
            .await?;
        if !unregistered.success() {
            return Err(Error::consistency(format!("cannot unregister {handle:?}")));
        }

        self.status(node).await
    }

    async fn shell_spec(&self, node: &str) -> Result<ShellSpec> {
        let params = shell_params(&self.manifest, node, PROVIDER_VIRTUALBOX)?;
        resolve_shell_spec(self, node, params, self.deadline).await
    }

    async fn bootstrap(&self, node: &str) -> Result<Value> {
        let mut commands = vec![
            "sudo mkdir -p /etc/armada/flags/".to_string(),
            "sudo chmod a+rx /etc/armada/flags/".to_string(),
            "[ ! -f /etc/armada/flags/network_ready ] && sudo ifconfig eth1 0.0.0.0 0.0.0.0"
                .to_string(),
            "[ ! -f /etc/armada/flags/network_ready ] && sudo ifconfig eth2 0.0.0.0 0.0.0.0"
                .to_string(),
            "[ ! -f /etc/armada/flags/network_ready ] && sudo dhclient -r eth1 eth2".to_string(),
            "[ ! -f /etc/armada/flags/network_ready ] && sudo dhclient eth1 eth2".to_string(),
            "[ ! -f /etc/armada/flags/network_ready ] && sudo touch /etc/armada/flags/network_ready"
                .to_string(),
        ];

        for (_, dst) in self.exposures(node)? {
            let share = share_handle(&dst);
            commands.push(format!("sudo mkdir -p {dst}"));
            commands.push(format!("sudo mount.vboxsf {share} {dst} -o rw"));
        }

        Ok(json!({ "merge": true, "bootstrap": commands }))
    }

    async fn pause(&self, node: &str) -> Result<NodeStatus> {
        debug!(node = %node, "pause");

        let status = self.status(node).await?;
        match status.state {
            NodeState::Paused => {
                return Err(Error::user(format!("node {node:?} is already paused")))
            }
            NodeState::Halting => return Err(Error::user(format!("node {node:?} is halting"))),
            NodeState::Stopped => return Err(Error::user(format!("node {node:?} is stopped"))),
            _ => {}
        }

        let handle = self.handle(node);
        let paused = self
            .executor
            .execute(&["controlvm", &handle, "pause"])
            .await?;
        if !paused.success() {
            return Err(Error::consistency(format!("cannot pause {handle:?}")));
        }

        self.status(node).await
    }

    async fn resume(&self, node: &str) -> Result<NodeStatus> {
        debug!(node = %node, "resume");

        let status = self.status(node).await?;
        self.require_state(node, &status, NodeState::Paused)?;

        let handle = self.handle(node);
        let resumed = self
            .executor
            .execute(&["controlvm", &handle, "resume"])
            .await?;
        if !resumed.success() {
            return Err(Error::consistency(format!("cannot resume {handle:?}")));
        }

        self.status(node).await
    }
}

/// Facts parsed from one `showvminfo` invocation.
#[derive(Debug, PartialEq)]
struct VmInfo {
    name: String,
    uuid: String,
    raw_state: String,
    /// NIC slot (1-based) -> attachment description.
    nics: Vec<(u32, String)>,
}

fn parse_vm_info(output: &str, node: &str) -> Result<VmInfo> {
    let mut name = None;
    let mut uuid = None;
    let mut raw_state = None;
    let mut nics = Vec::new();

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Name:") {
            name.get_or_insert_with(|| rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("UUID:") {
            uuid.get_or_insert_with(|| rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("State:") {
            // "running (since 2024-01-01T00:00:00.000000000)"
            let state = rest.trim();
            let state = state.split('(').next().unwrap_or(state).trim();
            raw_state.get_or_insert_with(|| state.to_string());
        } else if let Some(rest) = line.strip_prefix("NIC ") {
            let Some((slot, detail)) = rest.split_once(':') else {
                continue;
            };
            let Ok(slot) = slot.trim().parse::<u32>() else {
                continue;
            };
            if let Some(attachment) = field_value(detail, "Attachment:") {
                nics.push((slot, attachment));
            }
        }
    }

    let name =
        name.ok_or_else(|| Error::consistency(format!("cannot get machine name for node {node:?}")))?;
    let uuid =
        uuid.ok_or_else(|| Error::consistency(format!("cannot get machine uuid for node {node:?}")))?;
    let raw_state = raw_state
        .ok_or_else(|| Error::consistency(format!("cannot get machine state for node {node:?}")))?;

    Ok(VmInfo {
        name,
        uuid,
        raw_state,
        nics,
    })
}

/// Extract a `Key: value` field from a comma-separated detail string.
fn field_value(detail: &str, key: &str) -> Option<String> {
    let start = detail.find(key)? + key.len();
    let rest = &detail[start..];
    let value = rest.split(',').next().unwrap_or(rest).trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn map_raw_state(raw: &str) -> Option<NodeState> {
    match raw.trim().to_lowercase().as_str() {
        "saved" => Some(NodeState::Running),
        "running" => Some(NodeState::Running),
        "starting" => Some(NodeState::Booting),
        "restoring" => Some(NodeState::Booting),
        "paused" => Some(NodeState::Paused),
        "powered off" => Some(NodeState::Stopped),
        "aborted" => Some(NodeState::Stopped),
        // Degraded but alive; the guest may still respond.
        "guru meditation" => Some(NodeState::Running),
        _ => None,
    }
}

/// Per-interface guest facts keyed by the guest's 0-based net index.
#[derive(Debug, Default, PartialEq)]
struct IfaceFacts {
    status: Option<String>,
    v4_ip: Option<String>,
    v6_ip: Option<String>,
}

fn parse_guest_net(output: &str) -> Vec<(u32, IfaceFacts)> {
    const PREFIX: &str = "Name: /VirtualBox/GuestInfo/Net/";

    let mut ifaces: std::collections::BTreeMap<u32, IfaceFacts> = std::collections::BTreeMap::new();

    for line in output.lines() {
        let Some(rest) = line.strip_prefix(PREFIX) else {
            continue;
        };
        let Some((index, rest)) = rest.split_once('/') else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let Some((path, rest)) = rest.split_once(',') else {
            continue;
        };
        let Some(value) = field_value(rest, "value:") else {
            continue;
        };

        let facts = ifaces.entry(index).or_default();

        match path.trim() {
            "Status" => facts.status = Some(value.to_lowercase()),
            "V4/IP" => facts.v4_ip = Some(value),
            "V6/IP" => facts.v6_ip = Some(value),
            _ => {}
        }
    }

    ifaces.into_iter().collect()
}

/// Pick the address of the first "up" interface whose NIC attachment is
/// host-only. Guest net index `n` corresponds to NIC slot `n + 1`.
fn select_hostonly_address(ifaces: &[(u32, IfaceFacts)], nics: &[(u32, String)]) -> Option<String> {
    for (index, facts) in ifaces {
        if facts.status.as_deref() != Some("up") {
            continue;
        }

        let attachment = nics
            .iter()
            .find(|(slot, _)| *slot == index + 1)
            .map(|(_, attachment)| attachment.as_str());

        if !attachment.is_some_and(|a| a.starts_with("Host-only")) {
            continue;
        }

        if let Some(address) = facts.v4_ip.clone().or_else(|| facts.v6_ip.clone()) {
            return Some(address);
        }
    }

    None
}

/// Sanitize a share destination into a VirtualBox-safe share name.
fn share_handle(dst: &str) -> String {
    let mut handle = String::with_capacity(dst.len());
    let mut last_was_underscore = false;

    for c in dst.chars() {
        if c.is_ascii_alphanumeric() {
            handle.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            handle.push('_');
            last_was_underscore = true;
        }
    }

    handle.trim_matches('_').to_string()
}
