//! Container and pod lookup.
//!
//! Namespace sharing (`container:<id>`, `pod`), SELinux label inheritance and
//! `volumes_from` all need facts about other containers. The compiler asks for
//! them through [`ContainerLookup`]; the engine supplies the implementation.

use crate::mounts::{Mount, NamedVolume};
use crate::namespace::NamespaceFamily;
use serde::{Deserialize, Serialize};
use specgen_shared::{SpecgenError, SpecgenResult};
use std::collections::BTreeSet;

/// Facts about an existing container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// SELinux process label (`user:role:type:level`), empty when unconfined.
    pub process_label: String,
    pub mount_label: String,
    pub hostname: String,
    /// PID of the container's init process, 0 if not running.
    pub pid: i32,
    /// User-requested mounts, eligible for `volumes_from`.
    pub mounts: Vec<Mount>,
    pub volumes: Vec<NamedVolume>,
    /// Pod the container belongs to.
    pub pod: Option<String>,
}

/// Facts about a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodInfo {
    pub id: String,
    pub name: String,
    /// Namespace families members join.
    pub shared_namespaces: BTreeSet<NamespaceFamily>,
    /// Infra container holding the shared namespaces.
    pub infra_id: Option<String>,
    pub restart_policy: Option<String>,
    pub cgroup_parent: Option<String>,
    pub hostname: Option<String>,
}

impl PodInfo {
    pub fn shares(&self, family: NamespaceFamily) -> bool {
        self.shared_namespaces.contains(&family)
    }
}

/// Resolves references to other containers and pods.
pub trait ContainerLookup: Send + Sync {
    /// Find a container by ID or name.
    fn container(&self, id_or_name: &str) -> SpecgenResult<ContainerInfo>;

    /// Find a pod by ID or name.
    fn pod(&self, id_or_name: &str) -> SpecgenResult<PodInfo>;
}

/// Lookup for contexts with no other containers. Every reference fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

impl ContainerLookup for NoLookup {
    fn container(&self, id_or_name: &str) -> SpecgenResult<ContainerInfo> {
        Err(SpecgenError::container_not_found(id_or_name, "no such container"))
    }

    fn pod(&self, id_or_name: &str) -> SpecgenResult<PodInfo> {
        Err(SpecgenError::pod_not_found(id_or_name, "no such pod"))
    }
}
