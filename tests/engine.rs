//! End-to-end pipeline behavior over an in-memory provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use armada::actions::Action;
use armada::config::Manifest;
use armada::engine::{Engine, EngineOptions, LifecycleHook};
use armada::error::{Error, Result};
use armada::provider::{Auth, NodeState, NodeStatus, Provider, ShellSpec};
use armada::provision::Provisioner;

/// In-memory provider with one address per node and a real state machine
/// for the transition guards.
struct MockProvider {
    nodes: Mutex<HashMap<String, (NodeState, String)>>,
    pending_wakes: Mutex<Vec<String>>,
}

impl MockProvider {
    fn new(entries: &[(&str, NodeState, &str)]) -> Arc<Self> {
        let nodes = entries
            .iter()
            .map(|(name, state, address)| {
                (name.to_string(), (*state, address.to_string()))
            })
            .collect();
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            pending_wakes: Mutex::new(Vec::new()),
        })
    }

    /// Have the named node become running the next time any shell spec
    /// resolves, imitating a sibling that finishes booting while the
    /// provisioned node waits for its ssh port.
    fn wake_on_shell(&self, node: &str) {
        self.pending_wakes.lock().unwrap().push(node.to_string());
    }

    fn entry(&self, node: &str) -> Result<(NodeState, String)> {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| Error::user(format!("node {node:?} does not exist")))
    }

    fn set(&self, node: &str, state: NodeState) {
        if let Some(entry) = self.nodes.lock().unwrap().get_mut(node) {
            entry.0 = state;
        }
    }

    fn status_for(state: NodeState, address: &str) -> NodeStatus {
        NodeStatus {
            state,
            address: (state == NodeState::Running).then(|| address.to_string()),
            handle: Some("mock-handle".to_string()),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn status(&self, node: &str) -> Result<NodeStatus> {
        let (state, address) = self.entry(node)?;
        Ok(Self::status_for(state, &address))
    }

    async fn boot(&self, node: &str) -> Result<NodeStatus> {
        let (state, address) = self.entry(node)?;
        if state != NodeState::Stopped {
            return Err(Error::user(format!("node {node:?} is already running")));
        }
        self.set(node, NodeState::Running);
        Ok(Self::status_for(NodeState::Running, &address))
    }

    async fn halt(&self, node: &str) -> Result<NodeStatus> {
        let (state, address) = self.entry(node)?;
        if state == NodeState::Stopped {
            return Err(Error::user(format!("node {node:?} is already stopped")));
        }
        self.set(node, NodeState::Stopped);
        Ok(Self::status_for(NodeState::Stopped, &address))
    }

    async fn shell_spec(&self, node: &str) -> Result<ShellSpec> {
        for woken in self.pending_wakes.lock().unwrap().drain(..) {
            self.set(&woken, NodeState::Running);
        }

        let (state, address) = self.entry(node)?;
        if state != NodeState::Running {
            return Err(Error::user(format!("node {node:?} is stopped")));
        }
        Ok(ShellSpec {
            username: "armada".to_string(),
            auth: Auth::Password("pw".to_string()),
            host: address,
            port: 22,
        })
    }

    async fn bootstrap(&self, _node: &str) -> Result<Value> {
        Ok(json!({ "merge": true, "bootstrap": ["base-setup"] }))
    }
}

/// Records every provisioning call instead of opening ssh sessions.
#[derive(Default)]
struct RecordingProvisioner {
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn provision(
        &self,
        node: &str,
        overlay: &Value,
        _spec: &ShellSpec,
        _dry: bool,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((node.to_string(), overlay.clone()));
        Ok(())
    }
}

fn manifest(value: Value) -> Manifest {
    serde_json::from_value(value).unwrap()
}

fn engine(
    manifest_value: Value,
    provider: &Arc<MockProvider>,
    recorder: &Arc<RecordingProvisioner>,
) -> Engine {
    let options = EngineOptions {
        provider: Some("mock".to_string()),
        ..EngineOptions::default()
    };

    Engine::new(manifest(manifest_value), options)
        .with_provider("mock", Arc::clone(provider) as Arc<dyn Provider>)
        .with_provisioner(Arc::clone(recorder) as Arc<dyn Provisioner>)
}

fn two_node_manifest() -> Value {
    json!({
        "provision": { "merge": true, "bootstrap": ["deploy"] },
        "nodes": { "a": {}, "b": {} }
    })
}

#[tokio::test]
async fn booting_a_running_node_is_a_user_error() {
    let provider = MockProvider::new(&[("a", NodeState::Stopped, "192.0.2.1")]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Boot, &names)
        .await
        .unwrap();

    let err = engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Boot, &names)
        .await
        .unwrap_err();

    assert!(err.is_user());
    assert!(err.to_string().contains("already running"));
}

#[tokio::test]
async fn up_boots_waits_and_provisions() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Stopped, "192.0.2.1"),
        ("b", NodeState::Stopped, "192.0.2.2"),
    ]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Up, &names)
        .await
        .unwrap();

    assert_eq!(provider.entry("a").unwrap().0, NodeState::Running);
    assert_eq!(provider.entry("b").unwrap().0, NodeState::Stopped);

    let calls = recorder.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "a");

    // Provider bootstrap first, then the manifest layer.
    assert_eq!(calls[0].1["bootstrap"], json!(["base-setup", "deploy"]));
}

#[tokio::test]
async fn up_on_a_running_node_changes_nothing() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Running, "192.0.2.1"),
        ("b", NodeState::Stopped, "192.0.2.2"),
    ]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Up, &names)
        .await
        .unwrap();

    assert!(recorder.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn provisioning_publishes_running_sibling_addresses() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Running, "192.0.2.1"),
        ("b", NodeState::Running, "192.0.2.2"),
    ]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Provision, &names)
        .await
        .unwrap();

    let calls = recorder.calls.lock().unwrap();
    let commands = calls[0].1["bootstrap"].as_array().unwrap();

    assert_eq!(commands[0], "sudo mkdir -p /etc/armada/nodes/");
    assert_eq!(commands[1], "echo 192.0.2.2 | sudo tee /etc/armada/nodes/b");
    assert_eq!(commands[2], "base-setup");
    assert_eq!(commands[3], "deploy");
}

#[tokio::test]
async fn stopped_siblings_are_not_published() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Running, "192.0.2.1"),
        ("b", NodeState::Stopped, "192.0.2.2"),
    ]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Provision, &names)
        .await
        .unwrap();

    let calls = recorder.calls.lock().unwrap();
    assert_eq!(calls[0].1["bootstrap"], json!(["base-setup", "deploy"]));
}

#[tokio::test]
async fn siblings_becoming_ready_during_the_wait_are_published() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Running, "192.0.2.1"),
        ("b", NodeState::Stopped, "192.0.2.2"),
    ]);
    provider.wake_on_shell("b");
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Provision, &names)
        .await
        .unwrap();

    let calls = recorder.calls.lock().unwrap();
    let commands = calls[0].1["bootstrap"].as_array().unwrap();

    assert_eq!(commands[0], "sudo mkdir -p /etc/armada/nodes/");
    assert_eq!(commands[1], "echo 192.0.2.2 | sudo tee /etc/armada/nodes/b");
}

#[tokio::test]
async fn hooks_run_once_before_pipelines_and_may_adjust_the_manifest() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SeedProvision {
        calls: Arc<AtomicUsize>,
    }

    impl LifecycleHook for SeedProvision {
        fn before_run(
            &self,
            action: Action,
            _options: &EngineOptions,
            provider: &str,
            manifest: &mut Manifest,
        ) -> Result<()> {
            assert_eq!(action, Action::Provision);
            assert_eq!(provider, "mock");
            self.calls.fetch_add(1, Ordering::SeqCst);
            manifest.provision = Some(json!({ "merge": true, "bootstrap": ["hooked"] }));
            Ok(())
        }
    }

    let provider = MockProvider::new(&[("a", NodeState::Running, "192.0.2.1")]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let names = vec!["a".to_string()];

    // No provisioning configuration until the hook installs one.
    engine(json!({"nodes": {"a": {}}}), &provider, &recorder)
        .with_hook(Box::new(SeedProvision {
            calls: Arc::clone(&calls),
        }))
        .run(Action::Provision, &names)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let recorded = recorder.calls.lock().unwrap();
    assert_eq!(recorded[0].1["bootstrap"], json!(["base-setup", "hooked"]));
}

#[tokio::test]
async fn explicit_provision_without_configuration_fails() {
    let provider = MockProvider::new(&[("a", NodeState::Running, "192.0.2.1")]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    let err = engine(json!({"nodes": {"a": {}}}), &provider, &recorder)
        .run(Action::Provision, &names)
        .await
        .unwrap_err();

    assert!(err.is_user());
    assert!(err.to_string().contains("no provisioning configuration"));
}

#[tokio::test]
async fn boot_without_configuration_skips_provisioning() {
    let provider = MockProvider::new(&[("a", NodeState::Stopped, "192.0.2.1")]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    engine(json!({"nodes": {"a": {}}}), &provider, &recorder)
        .run(Action::Boot, &names)
        .await
        .unwrap();

    assert_eq!(provider.entry("a").unwrap().0, NodeState::Running);
    assert!(recorder.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn down_tolerates_stopped_nodes() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Running, "192.0.2.1"),
        ("b", NodeState::Stopped, "192.0.2.2"),
    ]);
    let recorder = Arc::new(RecordingProvisioner::default());

    engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Down, &[])
        .await
        .unwrap();

    assert_eq!(provider.entry("a").unwrap().0, NodeState::Stopped);
    assert_eq!(provider.entry("b").unwrap().0, NodeState::Stopped);
}

#[tokio::test]
async fn one_failing_node_does_not_stop_the_others() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Running, "192.0.2.1"),
        ("b", NodeState::Stopped, "192.0.2.2"),
    ]);
    let recorder = Arc::new(RecordingProvisioner::default());

    // Halting everything fails for "b" (already stopped) but must still
    // halt "a".
    let err = engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Halt, &[])
        .await
        .unwrap_err();

    assert!(err.is_user());
    assert_eq!(provider.entry("a").unwrap().0, NodeState::Stopped);
}

#[tokio::test]
async fn shell_requires_exactly_one_node() {
    let provider = MockProvider::new(&[
        ("a", NodeState::Running, "192.0.2.1"),
        ("b", NodeState::Running, "192.0.2.2"),
    ]);
    let recorder = Arc::new(RecordingProvisioner::default());

    let err = engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Shell, &[])
        .await
        .unwrap_err();

    assert!(err.is_user());
    assert!(err.to_string().contains("exactly one node"));
}

#[tokio::test]
async fn unknown_nodes_are_rejected_before_any_pipeline_runs() {
    let provider = MockProvider::new(&[("a", NodeState::Stopped, "192.0.2.1")]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["ghost".to_string()];

    let err = engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Boot, &names)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("ghost"));
    assert!(recorder.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pause_is_rejected_by_providers_without_support() {
    let provider = MockProvider::new(&[("a", NodeState::Running, "192.0.2.1")]);
    let recorder = Arc::new(RecordingProvisioner::default());
    let names = vec!["a".to_string()];

    let err = engine(two_node_manifest(), &provider, &recorder)
        .run(Action::Pause, &names)
        .await
        .unwrap_err();

    assert!(err.is_user());
    assert!(err.to_string().contains("does not support"));
}
