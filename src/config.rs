//! Manifest loading and property resolution.
//!
//! An armada manifest (`armada.json`) declares a set of named nodes plus
//! optional provider-level parameter bags. Provider-specific parameters
//! resolve node-first: a key is looked up in the node's bag for that
//! provider kind, then in the manifest-level bag of the same kind.
//!
//! The manifest records its own absolute location so relative resource
//! references (exposed directories, `file:` image URLs, key paths) can be
//! made absolute.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Manifest file name looked up when only a directory is given.
pub const MANIFEST_FILE: &str = "armada.json";

/// One node declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Default provider for this node, overriding the manifest default.
    pub provider: Option<String>,

    /// Namespace override scoping this node's external handle.
    pub namespace: Option<String>,

    /// Host directories exposed inside the machine (`source -> dest`),
    /// in declaration order.
    #[serde(default)]
    pub expose: IndexMap<String, String>,

    /// Node-level provisioning overlay.
    pub provision: Option<Value>,

    /// VirtualBox parameter bag.
    pub virtualbox: Option<Value>,

    /// Cloud parameter bag.
    pub cloud: Option<Value>,
}

/// A fully-parsed manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Named nodes in declaration order. Name is the unique key for
    /// every lifecycle operation.
    #[serde(default)]
    pub nodes: IndexMap<String, Node>,

    /// Default provider for nodes that do not declare one.
    pub provider: Option<String>,

    /// Default namespace for nodes that do not declare one.
    pub namespace: Option<String>,

    /// Manifest-level provisioning overlay.
    pub provision: Option<Value>,

    /// Manifest-level VirtualBox parameter bag.
    pub virtualbox: Option<Value>,

    /// Manifest-level cloud parameter bag.
    pub cloud: Option<Value>,

    /// Optional deadline for readiness waits. Absent means unbounded.
    pub readiness_timeout_secs: Option<u64>,

    /// Absolute path of the loaded manifest file.
    #[serde(skip)]
    pub location: PathBuf,
}

impl Manifest {
    /// Locate a manifest file from an explicit path or the working directory.
    ///
    /// A directory path resolves to `<dir>/armada.json`.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        let mut file = match explicit {
            Some(path) => path.to_path_buf(),
            None => std::env::current_dir()?.join(MANIFEST_FILE),
        };

        if file.is_dir() {
            file = file.join(MANIFEST_FILE);
        }

        if !file.is_file() {
            return Err(Error::user(format!(
                "manifest {:?} not found",
                file.display().to_string()
            )));
        }

        Ok(file)
    }

    /// Load and parse a manifest, recording its absolute location.
    pub fn load(path: &Path) -> Result<Manifest> {
        let raw = std::fs::read_to_string(path)?;

        let mut manifest: Manifest = serde_json::from_str(&raw)
            .map_err(|e| Error::user(format!("cannot parse manifest {:?}: {e}", path.display().to_string())))?;

        manifest.location = std::fs::canonicalize(path)?;

        Ok(manifest)
    }

    /// Look up a node, failing with a user error when it is unknown.
    pub fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .get(name)
            .ok_or_else(|| Error::user(format!("node {name:?} does not exist")))
    }

    /// Manifest-level parameter bag for a provider kind.
    pub fn bag(&self, kind: &str) -> Option<&Value> {
        match kind {
            "virtualbox" => self.virtualbox.as_ref(),
            "cloud" => self.cloud.as_ref(),
            _ => None,
        }
    }

    /// Resolve a provider-specific property: node bag first, then the
    /// manifest-level bag of the same kind.
    pub fn property<'a>(&'a self, node_name: &str, kind: &str, key: &str) -> Option<&'a Value> {
        if let Ok(node) = self.node(node_name) {
            if let Some(value) = node.bag(kind).and_then(|bag| bag.get(key)) {
                return Some(value);
            }
        }

        self.bag(kind).and_then(|bag| bag.get(key))
    }

    /// String form of a provider-specific property.
    pub fn string_property(&self, node_name: &str, kind: &str, key: &str) -> Option<String> {
        self.property(node_name, kind, key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Namespace for a node: node-level value, else the manifest default.
    pub fn namespace_for(&self, node_name: &str) -> Option<&str> {
        if let Ok(node) = self.node(node_name) {
            if let Some(ns) = node.namespace.as_deref() {
                return Some(ns);
            }
        }

        self.namespace.as_deref()
    }

    /// Directory the manifest lives in.
    pub fn base_dir(&self) -> &Path {
        self.location.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Make a manifest-relative reference absolute.
    pub fn resolve_path(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }
}

impl Node {
    /// Node-level parameter bag for a provider kind.
    pub fn bag(&self, kind: &str) -> Option<&Value> {
        match kind {
            "virtualbox" => self.virtualbox.as_ref(),
            "cloud" => self.cloud.as_ref(),
            _ => None,
        }
    }
}
