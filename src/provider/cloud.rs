//! Remote cloud provider.
//!
//! Talks to an instance-management HTTP API instead of a local
//! hypervisor. Instances are matched to nodes by name and namespace
//! tags; the API may briefly report several instances for one node
//! while an old one shuts down, in which case the most recently created
//! instance is authoritative.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Manifest;
use crate::error::{Error, Result};

use super::{
    resolve_shell_spec, shell_params, NodeState, NodeStatus, Provider, ShellSpec, PROVIDER_CLOUD,
};

/// Tag carrying the node name on every managed instance.
pub const TAG_NODE_NAME: &str = "armada-node-name";
/// Tag carrying the node namespace on every managed instance.
pub const TAG_NODE_NAMESPACE: &str = "armada-node-namespace";

/// One instance as reported by the management API.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudInstance {
    pub id: String,
    #[serde(rename = "state")]
    pub raw_state: String,
    pub address: Option<String>,
}

/// Minimal instance-management surface the provider needs. Split out so
/// tests can drive the provider without a live endpoint.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_instances(&self, name: &str, namespace: &str) -> Result<Vec<CloudInstance>>;
    async fn create_instance(
        &self,
        name: &str,
        namespace: &str,
        parameters: &Value,
    ) -> Result<Vec<CloudInstance>>;
    async fn terminate_instance(&self, id: &str) -> Result<()>;
    async fn create_tags(&self, id: &str, tags: &[(&str, &str)]) -> Result<()>;
    async fn delete_tags(&self, id: &str, tags: &[&str]) -> Result<()>;
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    namespace: &'a str,
    parameters: &'a Value,
}

#[derive(Serialize)]
struct TagRequest<'a> {
    tags: Vec<TagEntry<'a>>,
}

#[derive(Serialize)]
struct TagEntry<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
}

/// API client backed by the configured HTTP endpoint.
pub struct HttpCloudApi {
    http: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpCloudApi {
    pub fn new(endpoint: String, api_token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::communication(format!("cannot build http client ({e})")))?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.endpoint));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::communication(format!("cannot {what} ({e})")))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::user(format!(
                "cannot {what}, the configured api token was rejected"
            ))),
            status => Err(Error::communication(format!(
                "cannot {what} (http status {})",
                status.as_u16()
            ))),
        }
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn list_instances(&self, name: &str, namespace: &str) -> Result<Vec<CloudInstance>> {
        let builder = self
            .request(reqwest::Method::GET, "/v1/instances")
            .query(&[("name", name), ("namespace", namespace)]);

        self.send(builder, "list instances")
            .await?
            .json()
            .await
            .map_err(|e| Error::communication(format!("cannot decode instance listing ({e})")))
    }

    async fn create_instance(
        &self,
        name: &str,
        namespace: &str,
        parameters: &Value,
    ) -> Result<Vec<CloudInstance>> {
        let builder = self
            .request(reqwest::Method::POST, "/v1/instances")
            .json(&CreateRequest {
                name,
                namespace,
                parameters,
            });

        self.send(builder, "create instance")
            .await?
            .json()
            .await
            .map_err(|e| Error::communication(format!("cannot decode created instance ({e})")))
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        let builder = self.request(
            reqwest::Method::POST,
            &format!("/v1/instances/{id}/terminate"),
        );
        self.send(builder, "terminate instance").await?;
        Ok(())
    }

    async fn create_tags(&self, id: &str, tags: &[(&str, &str)]) -> Result<()> {
        let builder = self
            .request(reqwest::Method::PUT, &format!("/v1/instances/{id}/tags"))
            .json(&TagRequest {
                tags: tags
                    .iter()
                    .map(|(key, value)| TagEntry {
                        key,
                        value: Some(value),
                    })
                    .collect(),
            });
        self.send(builder, "tag instance").await?;
        Ok(())
    }

    async fn delete_tags(&self, id: &str, tags: &[&str]) -> Result<()> {
        let builder = self
            .request(reqwest::Method::DELETE, &format!("/v1/instances/{id}/tags"))
            .json(&TagRequest {
                tags: tags.iter().map(|key| TagEntry { key, value: None }).collect(),
            });
        self.send(builder, "untag instance").await?;
        Ok(())
    }
}

pub struct CloudProvider {
    manifest: Arc<Manifest>,
    api: Arc<dyn CloudApi>,
    deadline: Option<Duration>,
}

impl CloudProvider {
    pub fn new(manifest: Arc<Manifest>) -> Result<Self> {
        let bag = manifest
            .bag(PROVIDER_CLOUD)
            .ok_or_else(|| Error::user("no cloud configuration defined".to_string()))?;

        let endpoint = bag
            .get("endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::user("no cloud \"endpoint\" parameter specified".to_string()))?
            .to_string();

        let api_token = bag
            .get("apiToken")
            .and_then(Value::as_str)
            .map(str::to_string);

        let api = Arc::new(HttpCloudApi::new(endpoint, api_token)?);
        Ok(Self::with_api(manifest, api))
    }

    /// Build a provider over an arbitrary API implementation.
    pub fn with_api(manifest: Arc<Manifest>, api: Arc<dyn CloudApi>) -> Self {
        let deadline = manifest.readiness_timeout_secs.map(Duration::from_secs);
        Self {
            manifest,
            api,
            deadline,
        }
    }

    /// Suffix the node name onto control-plane failures so concurrent
    /// pipelines stay attributable in one-line reports.
    fn for_node(err: Error, node: &str) -> Error {
        match err {
            Error::Communication(msg) => {
                Error::communication(format!("{msg} for node {node:?}"))
            }
            other => other,
        }
    }

    fn namespace(&self, node: &str) -> String {
        self.manifest
            .namespace_for(node)
            .unwrap_or_default()
            .to_string()
    }

    fn launch_parameters(&self, node: &str) -> Value {
        self.manifest
            .property(node, PROVIDER_CLOUD, "instance")
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Pick the authoritative instance from an API listing. Extra
    /// live instances are reported but not acted upon.
    fn elect(&self, node: &str, instances: Vec<CloudInstance>) -> Option<CloudInstance> {
        if instances.len() > 1 {
            for stale in &instances[..instances.len() - 1] {
                if stale.raw_state != "terminated" {
                    warn!(
                        node = %node,
                        instance = %stale.id,
                        state = %stale.raw_state,
                        "ignoring extra instance"
                    );
                }
            }
        }

        instances.into_iter().last()
    }

    fn status_of(&self, node: &str, instance: &CloudInstance) -> Result<NodeStatus> {
        let mut state = match instance.raw_state.as_str() {
            "pending" => NodeState::Booting,
            "running" => NodeState::Running,
            "shutting-down" | "stopping" => NodeState::Halting,
            "stopped" | "terminated" => NodeState::Stopped,
            _ => {
                return Err(Error::consistency(format!("undefined state for node {node:?}")));
            }
        };

        let mut address = instance.address.clone();
        if address.is_none() && state == NodeState::Running {
            state = NodeState::Booting;
        }
        if state != NodeState::Running {
            address = None;
        }

        Ok(NodeStatus {
            state,
            address,
            handle: Some(instance.id.clone()),
        })
    }
}

#[async_trait]
impl Provider for CloudProvider {
    fn name(&self) -> &str {
        PROVIDER_CLOUD
    }

    async fn status(&self, node: &str) -> Result<NodeStatus> {
        self.manifest.node(node)?;

        let instances = self
            .api
            .list_instances(node, &self.namespace(node))
            .await
            .map_err(|e| Self::for_node(e, node))?;
        match self.elect(node, instances) {
            Some(instance) => self.status_of(node, &instance),
            None => Ok(NodeStatus::stopped()),
        }
    }

    async fn boot(&self, node: &str) -> Result<NodeStatus> {
        debug!(node = %node, "boot");

        let status = self.status(node).await?;
        match status.state {
            NodeState::Stopped => {}
            NodeState::Booting => {
                return Err(Error::user(format!("node {node:?} is already booting")))
            }
            NodeState::Running => {
                return Err(Error::user(format!("node {node:?} is already running")))
            }
            NodeState::Halting => return Err(Error::user(format!("node {node:?} is halting"))),
            NodeState::Paused => return Err(Error::user(format!("node {node:?} is paused"))),
        }

        let namespace = self.namespace(node);
        let parameters = self.launch_parameters(node);

        let created = self
            .api
            .create_instance(node, &namespace, &parameters)
            .await
            .map_err(|e| Self::for_node(e, node))?;
        let instance = self.elect(node, created).ok_or_else(|| {
            Error::communication(format!("no instance was created for node {node:?}"))
        })?;

        self.api
            .create_tags(
                &instance.id,
                &[(TAG_NODE_NAME, node), (TAG_NODE_NAMESPACE, &namespace)],
            )
            .await
            .map_err(|e| Self::for_node(e, node))?;

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

        let id = status.handle.ok_or_else(|| {
            Error::consistency(format!("no instance handle for node {node:?}"))
        })?;

        self.api
            .terminate_instance(&id)
            .await
            .map_err(|e| Self::for_node(e, node))?;
        self.api
            .delete_tags(&id, &[TAG_NODE_NAME, TAG_NODE_NAMESPACE])
            .await
            .map_err(|e| Self::for_node(e, node))?;

        self.status(node).await
    }

    async fn shell_spec(&self, node: &str) -> Result<ShellSpec> {
        let params = shell_params(&self.manifest, node, PROVIDER_CLOUD)?;
        resolve_shell_spec(self, node, params, self.deadline).await
    }

    async fn bootstrap(&self, node: &str) -> Result<Value> {
        let node_cfg = self.manifest.node(node)?;
        if !node_cfg.expose.is_empty() {
            return Err(Error::user(format!(
                "cannot expose directories to node {node:?} with the cloud provider"
            )));
        }

        Ok(json!({ "merge": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Arc<Manifest> {
        let raw = json!({
            "namespace": "proj",
            "cloud": { "endpoint": "http://localhost:1" },
            "nodes": { "web1": {} }
        });
        Arc::new(serde_json::from_value(raw).unwrap())
    }

    fn provider_over(instances: Vec<CloudInstance>) -> CloudProvider {
        struct Fixed(Vec<CloudInstance>);

        #[async_trait]
        impl CloudApi for Fixed {
            async fn list_instances(&self, _: &str, _: &str) -> Result<Vec<CloudInstance>> {
                Ok(self.0.clone())
            }
            async fn create_instance(&self, _: &str, _: &str, _: &Value) -> Result<Vec<CloudInstance>> {
                Ok(self.0.clone())
            }
            async fn terminate_instance(&self, _: &str) -> Result<()> {
                Ok(())
            }
            async fn create_tags(&self, _: &str, _: &[(&str, &str)]) -> Result<()> {
                Ok(())
            }
            async fn delete_tags(&self, _: &str, _: &[&str]) -> Result<()> {
                Ok(())
            }
        }

        CloudProvider::with_api(manifest(), Arc::new(Fixed(instances)))
    }

    fn instance(id: &str, state: &str, address: Option<&str>) -> CloudInstance {
        CloudInstance {
            id: id.to_string(),
            raw_state: state.to_string(),
            address: address.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn no_instances_means_stopped() {
        let status = provider_over(vec![]).status("web1").await.unwrap();
        assert_eq!(status.state, NodeState::Stopped);
        assert_eq!(status.address, None);
        assert_eq!(status.handle, None);
    }

    #[tokio::test]
    async fn last_instance_wins() {
        let provider = provider_over(vec![
            instance("i-old", "terminated", None),
            instance("i-new", "running", Some("198.51.100.7")),
        ]);

        let status = provider.status("web1").await.unwrap();
        assert_eq!(status.state, NodeState::Running);
        assert_eq!(status.address.as_deref(), Some("198.51.100.7"));
        assert_eq!(status.handle.as_deref(), Some("i-new"));
    }

    #[tokio::test]
    async fn running_without_address_is_still_booting() {
        let provider = provider_over(vec![instance("i-1", "running", None)]);
        let status = provider.status("web1").await.unwrap();
        assert_eq!(status.state, NodeState::Booting);
        assert_eq!(status.address, None);
    }

    #[tokio::test]
    async fn unknown_raw_state_is_a_consistency_error() {
        let provider = provider_over(vec![instance("i-1", "rebooting", None)]);
        let err = provider.status("web1").await.unwrap_err();
        assert!(err.to_string().contains("undefined state"));
    }

    #[tokio::test]
    async fn boot_refuses_a_running_node() {
        let provider = provider_over(vec![instance("i-1", "running", Some("198.51.100.7"))]);
        let err = provider.boot("web1").await.unwrap_err();
        assert!(err.is_user());
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn pause_is_unsupported() {
        let provider = provider_over(vec![]);
        let err = provider.pause("web1").await.unwrap_err();
        assert!(err.is_user());
    }
}
