//! Run orchestration: node-set resolution, hook dispatch, and concurrent
//! per-node pipeline execution.
//!
//! Each run owns its state. The manifest is mutable only while hooks run;
//! it is then frozen and shared with every node task. Pipelines for
//! different nodes run concurrently; steps within one node never overlap.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::actions::{Action, ActionContext};
use crate::config::Manifest;
use crate::error::{Error, Result};
use crate::provider::{Provider, Registry, DEFAULT_PROVIDER};
use crate::provision::{Provisioner, SshProvisioner};

/// Per-invocation options, as resolved from the command line.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Provider override applying to every node of the run.
    pub provider: Option<String>,

    /// Log provisioning commands without running them.
    pub dry: bool,

    /// One-shot command for the shell action.
    pub command: Option<String>,
}

/// Observes and may adjust a run before any pipeline starts.
///
/// Hooks run synchronously, in registration order, with exclusive access
/// to the manifest. This is the only point where the manifest is mutable.
/// `provider` is the run's default provider name; individual nodes may
/// still override it.
pub trait LifecycleHook {
    fn before_run(
        &self,
        action: Action,
        options: &EngineOptions,
        provider: &str,
        manifest: &mut Manifest,
    ) -> Result<()>;
}

pub struct Engine {
    manifest: Manifest,
    options: EngineOptions,
    hooks: Vec<Box<dyn LifecycleHook>>,
    provisioner: Arc<dyn Provisioner>,
    seeded: Vec<(String, Arc<dyn Provider>)>,
}

impl Engine {
    pub fn new(manifest: Manifest, options: EngineOptions) -> Self {
        Self {
            manifest,
            options,
            hooks: Vec::new(),
            provisioner: Arc::new(SshProvisioner),
            seeded: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Pre-register a provider instance under a name, bypassing the
    /// registry's constructors for that name.
    pub fn with_provider(mut self, name: &str, provider: Arc<dyn Provider>) -> Self {
        self.seeded.push((name.to_string(), provider));
        self
    }

    /// Run one action against the selected nodes (all nodes when `names`
    /// is empty). Pipelines run concurrently per node; every pipeline
    /// runs to completion before the first failure is reported.
    pub async fn run(mut self, action: Action, names: &[String]) -> Result<()> {
        let default_provider = self
            .options
            .provider
            .clone()
            .or_else(|| self.manifest.provider.clone())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        for hook in &self.hooks {
            hook.before_run(action, &self.options, &default_provider, &mut self.manifest)?;
        }

        let nodes = select_nodes(&self.manifest, names)?;
        if action.single_node() && nodes.len() != 1 {
            return Err(Error::user(format!(
                "action \"{action}\" requires exactly one node"
            )));
        }

        let manifest = Arc::new(self.manifest);
        let registry = Arc::new(Registry::new(Arc::clone(&manifest)));
        for (name, provider) in self.seeded {
            registry.seed(&name, provider);
        }

        let context = Arc::new(ActionContext {
            manifest,
            registry,
            provisioner: self.provisioner,
            options: Arc::new(self.options),
        });

        debug!(action = %action, nodes = ?nodes, "run start");

        let mut tasks = JoinSet::new();
        for node in nodes {
            let context = Arc::clone(&context);
            tasks.spawn(async move {
                let outcome = context.run(action, &node).await;
                (node, outcome)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (node, outcome) = joined
                .map_err(|e| Error::consistency(format!("pipeline task failed ({e})")))?;

            if let Err(err) = outcome {
                error!(node = %node, error = %err, "pipeline failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Resolve the node set for a run: explicit names are validated and
/// deduplicated preserving first occurrence; no names means every node.
fn select_nodes(manifest: &Manifest, names: &[String]) -> Result<Vec<String>> {
    if names.is_empty() {
        if manifest.nodes.is_empty() {
            return Err(Error::user("no nodes defined".to_string()));
        }
        return Ok(manifest.nodes.keys().cloned().collect());
    }

    let mut selected: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        manifest.node(name)?;
        if !selected.contains(name) {
            selected.push(name.clone());
        }
    }

    if selected.is_empty() {
        return Err(Error::user("no nodes selected".to_string()));
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_with(nodes: serde_json::Value) -> Manifest {
        serde_json::from_value(json!({ "nodes": nodes })).unwrap()
    }

    #[test]
    fn all_nodes_when_none_are_named() {
        let manifest = manifest_with(json!({"a": {}, "b": {}}));
        assert_eq!(select_nodes(&manifest, &[]).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn implicit_set_follows_declaration_order() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"nodes": {"web2": {}, "web1": {}, "db": {}}}"#).unwrap();
        assert_eq!(
            select_nodes(&manifest, &[]).unwrap(),
            vec!["web2", "web1", "db"]
        );
    }

    #[test]
    fn empty_manifest_is_a_user_error() {
        let manifest = manifest_with(json!({}));
        let err = select_nodes(&manifest, &[]).unwrap_err();
        assert!(err.is_user());
        assert!(err.to_string().contains("no nodes defined"));
    }

    #[test]
    fn explicit_names_keep_order_and_dedup() {
        let manifest = manifest_with(json!({"a": {}, "b": {}, "c": {}}));
        let names = vec!["c".to_string(), "a".to_string(), "c".to_string()];
        assert_eq!(select_nodes(&manifest, &names).unwrap(), vec!["c", "a"]);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let manifest = manifest_with(json!({"a": {}}));
        let names = vec!["ghost".to_string()];
        let err = select_nodes(&manifest, &names).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
