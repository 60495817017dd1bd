//! armada: provisioning and lifecycle control for manifest-defined
//! machines.
//!
//! A manifest (`armada.json`) declares named nodes; actions drive them
//! through a provider, either local VirtualBox VMs or instances behind a
//! cloud management API. Node state is never persisted: every action
//! derives it fresh from the control plane.

pub mod actions;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod exec;
pub mod import;
pub mod merge;
pub mod poll;
pub mod provider;
pub mod provision;
pub mod shell;

pub use actions::Action;
pub use config::Manifest;
pub use engine::{Engine, EngineOptions, LifecycleHook};
pub use error::{Error, Result};
pub use provider::{NodeState, NodeStatus, Provider, Registry};
pub use provision::Provisioner;
