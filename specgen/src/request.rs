//! The container creation request.
//!
//! [`SpecGenerator`] is grouped the way the compiler consumes it (basic,
//! storage, security, cgroup, network, resources). On the wire every group is
//! flattened into a single JSON/YAML object with snake_case keys.
//!
//! Namespace fields hold raw literals (`"host"`, `"container:abc"`, ...);
//! `None` means "use the pod or engine default".

use crate::mounts::ImageVolumeMode;
use crate::ports::PortMapping;
use crate::resources::ResourceFlags;
use serde::{Deserialize, Serialize};
use specgen_shared::{SpecgenError, SpecgenResult};
use std::collections::BTreeMap;

// ============================================================================
// Enumerations
// ============================================================================

/// Where the seccomp profile comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeccompPolicy {
    /// Explicit path, else the engine default.
    #[default]
    Default,
    /// Profile carried by the image label.
    Image,
}

/// Whether the container runs systemd as PID 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemdMode {
    /// Detected from the command.
    #[default]
    True,
    False,
    Always,
}

/// Log driver selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub driver: Option<String>,
    pub path: Option<String>,
    pub tag: Option<String>,
    pub options: BTreeMap<String, String>,
}

/// One contiguous ID range of a user namespace mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    /// Parse `container:host:size`.
    pub fn parse(raw: &str) -> SpecgenResult<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        let bad = || SpecgenError::parse(format!("invalid ID mapping {:?}: expected container:host:size", raw));
        let [c, h, s] = parts.as_slice() else {
            return Err(bad());
        };
        let map = Self {
            container_id: c.parse().map_err(|_| bad())?,
            host_id: h.parse().map_err(|_| bad())?,
            size: s.parse().map_err(|_| bad())?,
        };
        if map.size == 0 {
            return Err(bad());
        }
        Ok(map)
    }

    /// Whether `id` inside the container is mapped by this range.
    pub fn contains(&self, id: u32) -> bool {
        id >= self.container_id && (id - self.container_id) < self.size
    }
}

/// UID/GID mappings for a private user namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMappingOptions {
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

impl IdMappingOptions {
    pub fn is_empty(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }

    /// Whether `gid` is mapped. Without GID mappings every ID is available.
    pub fn has_gid(&self, gid: u32) -> bool {
        self.gid_map.is_empty() || self.gid_map.iter().any(|m| m.contains(gid))
    }
}

// ============================================================================
// Request Groups
// ============================================================================

/// Name, command, environment and lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    pub name: String,
    pub pod: Option<String>,
    /// Overrides the image entrypoint when set, even to an empty list.
    pub entrypoint: Option<Vec<String>>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub terminal: bool,
    pub stdin: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u32>,
    pub log_configuration: LogConfig,
    pub restart_policy: Option<String>,
    pub restart_tries: Option<u32>,
    pub hostname: Option<String>,
    pub utsns: Option<String>,
    pub pidns: Option<String>,
    pub remove: bool,
    pub pid_file: Option<String>,
    pub systemd: SystemdMode,
    pub init: bool,
    pub init_path: Option<String>,
    pub sysctl: BTreeMap<String, String>,
    pub exit_command: Vec<String>,
    /// Seconds the container may run before being killed.
    pub timeout: Option<u32>,
    /// Containers that must start first.
    pub dependencies: Vec<String>,
}

/// Image, rootfs, mounts and devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub image: String,
    pub rootfs: Option<String>,
    pub image_volume_mode: Option<ImageVolumeMode>,
    /// `--volume` values.
    pub volumes: Vec<String>,
    /// `--mount` values.
    pub mounts: Vec<String>,
    /// `--tmpfs` values.
    pub tmpfs: Vec<String>,
    /// `id[:ro|rw]` entries.
    pub volumes_from: Vec<String>,
    /// `src[:dst][:perms]` entries.
    pub devices: Vec<String>,
    /// `type major:minor access` entries.
    pub device_cgroup_rule: Vec<String>,
    pub work_dir: Option<String>,
    pub read_write_tmpfs: bool,
    pub ipcns: Option<String>,
    pub shm_size: Option<String>,
}

/// Identity and confinement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub privileged: bool,
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    /// `--security-opt label=` values without the `label=` prefix.
    pub selinux_opts: Vec<String>,
    pub apparmor_profile: Option<String>,
    pub seccomp_policy: SeccompPolicy,
    /// Profile path, or `unconfined`.
    pub seccomp_profile_path: Option<String>,
    pub no_new_privileges: bool,
    pub read_only_filesystem: bool,
    pub userns: Option<String>,
    pub idmappings: IdMappingOptions,
    /// Extra paths to mask.
    pub mask: Vec<String>,
    /// Paths to unmask, or `ALL`.
    pub unmask: Vec<String>,
    pub umask: Option<String>,
}

/// Control group placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    pub cgroupns: Option<String>,
    pub cgroup_parent: Option<String>,
    /// `enabled`, `disabled`, `no-conmon` or `split`.
    pub cgroups_mode: Option<String>,
}

/// Network attachment, ports and name resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `--network` values.
    pub network: Vec<String>,
    pub port_mappings: Vec<PortMapping>,
    /// `--publish` values, parsed with [`crate::ports::parse_port_spec`].
    pub publish: Vec<String>,
    /// `port[-end][/proto]` values.
    pub expose: Vec<String>,
    pub publish_exposed_ports: bool,
    pub dns_server: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_option: Vec<String>,
    /// `host:ip` entries for /etc/hosts.
    pub hostadd: Vec<String>,
    pub no_hosts: bool,
}

/// Resource limits plus process-level knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    #[serde(flatten)]
    pub limits: ResourceFlags,
    pub oom_score_adj: Option<i32>,
}

/// The complete creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecGenerator {
    #[serde(flatten)]
    pub basic: BasicConfig,
    #[serde(flatten)]
    pub storage: StorageConfig,
    #[serde(flatten)]
    pub security: SecurityConfig,
    #[serde(flatten)]
    pub cgroup: CgroupConfig,
    #[serde(flatten)]
    pub network: NetworkConfig,
    #[serde(flatten)]
    pub resources: ResourceConfig,
}

impl SpecGenerator {
    /// A request for `image` with everything else defaulted.
    pub fn new(image: impl Into<String>) -> Self {
        let mut spec = Self::default();
        spec.storage.image = image.into();
        spec
    }

    /// Parse a request from JSON.
    pub fn from_json(json: &str) -> SpecgenResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a request from YAML.
    pub fn from_yaml(yaml: &str) -> SpecgenResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| SpecgenError::parse(format!("request: {}", e)))
    }

    /// Structural checks that need no host state.
    pub fn validate(&self) -> SpecgenResult<()> {
        if self.storage.image.is_empty() && self.storage.rootfs.is_none() {
            return Err(SpecgenError::invalid_config("one of image or rootfs must be set"));
        }
        if !self.storage.image.is_empty() && self.storage.rootfs.is_some() {
            return Err(SpecgenError::invalid_config("image and rootfs are mutually exclusive"));
        }
        if self.security.privileged && !self.security.cap_add.is_empty() {
            return Err(SpecgenError::invalid_config(
                "privileged containers cannot be given additional capabilities",
            ));
        }
        if self.basic.restart_tries.is_some()
            && self
                .basic
                .restart_policy
                .as_deref()
                .is_none_or(|p| !p.starts_with("on-failure"))
        {
            return Err(SpecgenError::invalid_config(
                "restart retries can only be set with restart policy on-failure",
            ));
        }
        if self.basic.remove
            && self
                .basic
                .restart_policy
                .as_deref()
                .is_some_and(|p| !p.is_empty() && p != "no")
        {
            return Err(SpecgenError::invalid_config(
                "the remove option cannot be combined with a restart policy",
            ));
        }
        Ok(())
    }
}
